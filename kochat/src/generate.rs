//! Greedy response generation.
use candle_core::{Device, IndexOp, Tensor, D};
use kochat_transformers::architectures::CausalLM;
use kochat_transformers::error::BoxedError;
use kochat_transformers::kv_cache::KeyValueCache;
use kochat_transformers::layers::attention::{AttentionMask, AttentionMaskError};
use kochat_transformers::models::transformer::TransformerCausalLM;
use kochat_transformers::tokenizers::{HfTokenizer, Tokenizer, TokenizerEncodeInput};
use snafu::{ensure, ResultExt, Snafu};
use tracing::debug;

use crate::tokens::{pieces_to_text, prompt_text, SpecialPieces, TokensError};

#[derive(Debug, Snafu)]
pub enum GenerateError {
    #[snafu(display("Cannot generate from an empty prompt"))]
    EmptyPrompt,

    #[snafu(display(
        "Prompt of {prompt_len} pieces exceeds the maximum of {n_positions} positions"
    ))]
    PromptTooLong {
        prompt_len: usize,
        n_positions: usize,
    },

    #[snafu(display("Cannot create decoder input"))]
    Input { source: candle_core::Error },

    #[snafu(display("Cannot create attention mask"))]
    Mask { source: AttentionMaskError },

    #[snafu(display("Cannot run decoder"))]
    Decode { source: BoxedError },

    #[snafu(display("Cannot pick next piece"))]
    PickPiece { source: candle_core::Error },

    #[snafu(display("Cannot tokenize prompt"))]
    Tokenize { source: BoxedError },

    #[snafu(display("Cannot look up special pieces"))]
    SpecialPieces { source: TokensError },
}

/// Greedy decoding with a key/value cache.
pub struct GreedyGenerator<'a> {
    model: &'a TransformerCausalLM,
    eos_id: u32,
    max_new_pieces: usize,
}

impl<'a> GreedyGenerator<'a> {
    /// Create a generator that stops at `eos_id` or after
    /// `max_new_pieces` pieces.
    pub fn new(model: &'a TransformerCausalLM, eos_id: u32, max_new_pieces: usize) -> Self {
        GreedyGenerator {
            model,
            eos_id,
            max_new_pieces,
        }
    }

    fn next_piece(
        &self,
        input: &Tensor,
        mask: &AttentionMask,
        cache: &mut KeyValueCache,
    ) -> Result<u32, GenerateError> {
        let output = self
            .model
            .forward_t(input, mask, cache, None, false)
            .context(DecodeSnafu)?;
        let logits = output.logits();
        let (_, seq_len, _) = logits.dims3().context(PickPieceSnafu)?;
        logits
            .i((0, seq_len - 1))
            .and_then(|last| last.argmax(D::Minus1))
            .and_then(|piece| piece.to_scalar::<u32>())
            .context(PickPieceSnafu)
    }

    /// Generate the pieces that follow a prompt.
    ///
    /// Generation also stops when the model runs out of positions.
    /// The end-of-sequence piece is not included in the output.
    pub fn generate(&self, prompt_ids: &[u32], device: &Device) -> Result<Vec<u32>, GenerateError> {
        ensure!(!prompt_ids.is_empty(), EmptyPromptSnafu);
        let n_positions = self.model.decoder().n_positions();
        if let Some(n_positions) = n_positions {
            ensure!(
                prompt_ids.len() <= n_positions,
                PromptTooLongSnafu {
                    prompt_len: prompt_ids.len(),
                    n_positions
                }
            );
        }

        let mut generated = Vec::new();
        if self.max_new_pieces == 0 {
            return Ok(generated);
        }

        let mut cache = KeyValueCache::cache();
        let mut input = Tensor::new(prompt_ids, device)
            .and_then(|ids| ids.unsqueeze(0))
            .context(InputSnafu)?;
        let mut mask = AttentionMask::from_lengths(&[prompt_ids.len()], prompt_ids.len(), device)
            .context(MaskSnafu)?;
        let piece_mask = AttentionMask::from_lengths(&[1], 1, device).context(MaskSnafu)?;
        let mut n_fed = prompt_ids.len();

        loop {
            let piece = self.next_piece(&input, &mask, &mut cache)?;
            if piece == self.eos_id {
                break;
            }
            generated.push(piece);

            if generated.len() >= self.max_new_pieces
                || n_positions.is_some_and(|n_positions| n_fed >= n_positions)
            {
                debug!(n_pieces = generated.len(), "Response truncated");
                break;
            }

            input = Tensor::new(&[[piece]], device).context(InputSnafu)?;
            mask = mask.extend(&piece_mask).context(MaskSnafu)?;
            n_fed += 1;
        }

        Ok(generated)
    }
}

/// Drop utterance pieces from the start of a prompt until it has at most
/// `max_len` pieces.
///
/// The leading user piece and everything from the last sentiment
/// separator on are kept, so a prompt can still be longer than `max_len`
/// afterwards.
fn truncate_prompt(prompt_ids: &mut Vec<u32>, max_len: usize, special_pieces: &SpecialPieces) {
    if prompt_ids.len() <= max_len {
        return;
    }
    let utterance_start = usize::from(prompt_ids.first() == Some(&special_pieces.user));
    let utterance_end = prompt_ids
        .iter()
        .rposition(|&id| id == special_pieces.sentiment)
        .unwrap_or(prompt_ids.len())
        .max(utterance_start);
    let n_drop = (prompt_ids.len() - max_len).min(utterance_end - utterance_start);
    prompt_ids.drain(utterance_start..utterance_start + n_drop);
}

/// Answers utterances with a fine-tuned model.
pub struct ChatResponder {
    device: Device,
    max_response_len: usize,
    model: TransformerCausalLM,
    special_pieces: SpecialPieces,
    tokenizer: HfTokenizer,
}

impl ChatResponder {
    pub fn new(
        model: TransformerCausalLM,
        tokenizer: HfTokenizer,
        max_response_len: usize,
        device: Device,
    ) -> Result<Self, GenerateError> {
        let special_pieces =
            SpecialPieces::from_tokenizer(&tokenizer).context(SpecialPiecesSnafu)?;
        Ok(ChatResponder {
            device,
            max_response_len,
            model,
            special_pieces,
            tokenizer,
        })
    }

    /// Generate the answer to an utterance, given the sentiment of the
    /// system.
    pub fn respond(&self, utterance: &str, sentiment: &str) -> Result<String, GenerateError> {
        let mut prompt = self
            .tokenizer
            .encode_with(
                [TokenizerEncodeInput::RawString(prompt_text(utterance, sentiment))],
                false,
                None,
            )
            .context(TokenizeSnafu)?;
        let mut prompt_ids = prompt.ids.pop().unwrap_or_default();
        if let Some(n_positions) = self.model.decoder().n_positions() {
            let prompt_len = prompt_ids.len();
            truncate_prompt(&mut prompt_ids, n_positions, &self.special_pieces);
            if prompt_ids.len() < prompt_len {
                debug!(
                    prompt_len,
                    n_positions,
                    "Dropped start of utterance that does not fit the model"
                );
            }
        }

        let generated = GreedyGenerator::new(
            &self.model,
            self.special_pieces.eos,
            self.max_response_len,
        )
        .generate(&prompt_ids, &self.device)?;

        let pieces = generated
            .iter()
            .filter_map(|&id| self.tokenizer.id_to_piece(id))
            .collect::<Vec<_>>();
        Ok(pieces_to_text(&pieces))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, IndexOp, Tensor, D};
    use kochat_transformers::architectures::CausalLM;
    use kochat_transformers::kv_cache::KeyValueCache;
    use kochat_transformers::layers::attention::AttentionMask;
    use rstest::rstest;

    use super::{truncate_prompt, ChatResponder, GreedyGenerator};
    use crate::tokens::SpecialPieces;
    use crate::util::tests::{tiny_causal_lm, tiny_tokenizer};

    /// Greedy decoding that recomputes the full sequence every step.
    fn recompute_greedy(
        model: &kochat_transformers::models::transformer::TransformerCausalLM,
        prompt_ids: &[u32],
        eos_id: u32,
        max_new_pieces: usize,
    ) -> Vec<u32> {
        let device = Device::Cpu;
        let mut ids = prompt_ids.to_vec();
        let mut generated = Vec::new();
        while generated.len() < max_new_pieces {
            let input = Tensor::new(ids.as_slice(), &device)
                .unwrap()
                .unsqueeze(0)
                .unwrap();
            let mask = AttentionMask::from_lengths(&[ids.len()], ids.len(), &device).unwrap();
            let output = model
                .forward_t(&input, &mask, &mut KeyValueCache::no_cache(), None, false)
                .unwrap();
            let piece = output
                .logits()
                .i((0, ids.len() - 1))
                .unwrap()
                .argmax(D::Minus1)
                .unwrap()
                .to_scalar::<u32>()
                .unwrap();
            if piece == eos_id {
                break;
            }
            generated.push(piece);
            ids.push(piece);
        }
        generated
    }

    #[rstest]
    #[case(1)]
    #[case(999)]
    fn cached_decoding_matches_recomputation(#[case] eos_id: u32) {
        let device = Device::Cpu;
        let model = tiny_causal_lm(&device).model;
        let prompt = [2, 10, 6, 7, 4];

        let generated = GreedyGenerator::new(&model, eos_id, 6)
            .generate(&prompt, &device)
            .unwrap();
        assert_eq!(generated, recompute_greedy(&model, &prompt, eos_id, 6));
    }

    #[rstest]
    #[case(3, 3)]
    #[case(100, 7)]
    #[case(0, 0)]
    fn generation_is_bounded(#[case] max_new_pieces: usize, #[case] expected_len: usize) {
        let device = Device::Cpu;
        let model = tiny_causal_lm(&device).model;
        // The tiny model has 16 positions.
        let prompt = [2, 10, 11, 12, 13, 14, 15, 16, 17, 4];

        // The vocabulary has no piece 999, so decoding never stops early.
        let generated = GreedyGenerator::new(&model, 999, max_new_pieces)
            .generate(&prompt, &device)
            .unwrap();
        assert_eq!(generated.len(), expected_len);
    }

    #[test]
    fn rejects_invalid_prompts() {
        let device = Device::Cpu;
        let model = tiny_causal_lm(&device).model;
        let generator = GreedyGenerator::new(&model, 1, 4);
        assert!(generator.generate(&[], &device).is_err());
        assert!(generator.generate(&[7; 17], &device).is_err());
    }

    #[test]
    fn responder_returns_text() {
        let device = Device::Cpu;
        let (_dir, tokenizer) = tiny_tokenizer();
        let model = tiny_causal_lm(&device).model;
        let responder = ChatResponder::new(model, tokenizer, 4, device).unwrap();
        let answer = responder.respond("안녕", "0").unwrap();
        assert!(!answer.starts_with(' ') && !answer.ends_with(' '));
    }

    #[rstest]
    // <usr> 안녕 × 20 <unused1> 0 <sys>
    #[case(
        [vec![2], vec![10; 20], vec![6, 7, 4]].concat(),
        16,
        [vec![2], vec![10; 12], vec![6, 7, 4]].concat()
    )]
    #[case(vec![2, 10, 11, 6, 7, 4], 16, vec![2, 10, 11, 6, 7, 4])]
    #[case(vec![2, 13, 14, 10, 6, 7, 4], 5, vec![2, 10, 6, 7, 4])]
    #[case(vec![2, 10, 6, 7, 4], 3, vec![2, 6, 7, 4])]
    fn truncates_start_of_utterance(
        #[case] mut prompt_ids: Vec<u32>,
        #[case] max_len: usize,
        #[case] expected: Vec<u32>,
    ) {
        let (_dir, tokenizer) = tiny_tokenizer();
        let special_pieces = SpecialPieces::from_tokenizer(&tokenizer).unwrap();
        truncate_prompt(&mut prompt_ids, max_len, &special_pieces);
        assert_eq!(prompt_ids, expected);
    }

    #[test]
    fn responder_answers_utterances_longer_than_the_model() {
        let device = Device::Cpu;
        let (_dir, tokenizer) = tiny_tokenizer();
        let model = tiny_causal_lm(&device).model;
        let responder = ChatResponder::new(model, tokenizer, 4, device).unwrap();
        assert!(responder.respond(&["안녕"; 20].join(" "), "0").is_ok());
    }
}
