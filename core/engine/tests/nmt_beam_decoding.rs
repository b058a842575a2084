// tests/nmt_beam_decoding.rs
// 用 ScriptedRuntime 驱动 beam search：手算的得分，以及 KV cache 随 beam 来源重排

mod common;

use ndarray::{arr1, Array2};
use nmt_engine::nmt_incremental::beam_search::{softmax, BeamSearchParams, PROBABILITY_FLOOR};
use nmt_engine::nmt_incremental::{BeamSearchDecoder, DecoderParams, EncoderOutput, ScriptedRuntime};
use nmt_engine::TokenId;
use tokio_util::sync::CancellationToken;

use common::{EOS, PAD};

const A: TokenId = 3;
const B: TokenId = 4;

/// 词表 [<unk>, <pad>, </s>, a, b]；特殊 token 给很低的 logit
fn row(eos: f32, a: f32, b: f32) -> Vec<f32> {
    vec![-10.0, -10.0, eos.ln(), a.ln(), b.ln()]
}

fn ln_p(row: &[f32], token: TokenId) -> f32 {
    softmax(arr1(row).view())[token as usize]
        .max(PROBABILITY_FLOOR)
        .ln()
}

fn params(beam_count: usize, max_sequence_length: usize) -> DecoderParams {
    DecoderParams {
        search: BeamSearchParams::new(beam_count, PAD, EOS),
        max_sequence_length,
        kv_cache_max_positions: 512,
    }
}

fn encoder_output() -> EncoderOutput {
    EncoderOutput::new(Array2::zeros((3, 4)), vec![1, 1, 1]).unwrap()
}

#[test]
fn test_two_beams_three_steps_hand_computed() {
    let table = |history: &[TokenId]| -> Option<Vec<f32>> {
        Some(match history {
            [PAD] => row(0.1, 0.6, 0.3),
            [PAD, A] => row(0.9, 0.05, 0.05),
            [PAD, B] => row(0.2, 0.8, 1e-4),
            [PAD, A, EOS] => row(0.99, 0.005, 0.005),
            [PAD, B, A] => row(0.6, 1e-4, 0.4),
            _ => row(1.0, 1e-4, 1e-4),
        })
    };
    let mut runtime = ScriptedRuntime::new(table).preloaded();
    let stats = runtime.stats();

    let decoder =
        BeamSearchDecoder::new(&mut runtime, encoder_output(), params(2, 3), CancellationToken::new())
            .unwrap();
    let best = decoder.run().unwrap();

    assert_eq!(best.sequence, vec![PAD, A, EOS, EOS]);
    let expected = ln_p(&row(0.1, 0.6, 0.3), A)
        + ln_p(&row(0.9, 0.05, 0.05), EOS)
        + ln_p(&row(0.99, 0.005, 0.005), EOS);
    assert!((best.score - expected).abs() < 1e-5, "{} vs {expected}", best.score);

    let histories = stats.histories();
    assert_eq!(histories.len(), 3);
    assert_eq!(histories[0], vec![vec![PAD], vec![PAD]]);
    assert_eq!(histories[1], vec![vec![PAD, A], vec![PAD, B]]);
    assert_eq!(histories[2], vec![vec![PAD, A, EOS], vec![PAD, B, A]]);
}

#[test]
fn test_cache_follows_beam_origins_when_beams_swap() {
    let table = |history: &[TokenId]| -> Option<Vec<f32>> {
        Some(match history {
            [PAD] => row(1e-4, 0.6, 0.4),
            [PAD, A] => row(1e-4, 0.5, 0.5),
            [PAD, B] => row(0.05, 0.95, 1e-4),
            _ => row(1.0, 1e-4, 1e-4),
        })
    };
    let mut runtime = ScriptedRuntime::new(table).preloaded();
    let stats = runtime.stats();

    let mut decoder =
        BeamSearchDecoder::new(&mut runtime, encoder_output(), params(2, 3), CancellationToken::new())
            .unwrap();
    decoder.advance().unwrap();
    decoder.advance().unwrap();

    // 第二步后原来的第 2 个 beam 排到了第一位
    let sequences: Vec<Vec<TokenId>> = decoder.beams().iter().map(|b| b.sequence.clone()).collect();
    assert_eq!(sequences, vec![vec![PAD, B, A], vec![PAD, A, A]]);

    decoder.advance().unwrap();
    let histories = stats.histories();
    assert_eq!(histories[2], vec![vec![PAD, B, A], vec![PAD, A, A]]);
}

#[test]
fn test_min_probability_keeps_best_candidate() {
    let table = |_: &[TokenId]| Some(row(0.9, 0.05, 0.05));
    let mut runtime = ScriptedRuntime::new(table).preloaded();

    let mut params = params(2, 4);
    params.search.min_probability = 0.5;
    let decoder =
        BeamSearchDecoder::new(&mut runtime, encoder_output(), params, CancellationToken::new()).unwrap();
    let best = decoder.run().unwrap();
    assert_eq!(best.sequence[..2], [PAD, EOS]);
}
