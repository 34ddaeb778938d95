//! Token counting with tiktoken
//!
//! Encoders are loaded lazily per model name and cached. Unknown models fall
//! back to `cl100k_base`; if no encoder can be built at all, whitespace
//! separated words are counted instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Counts tokens of model output, caching one encoder per model
#[derive(Default)]
pub struct TokenCounter {
    encoders: Mutex<HashMap<String, Option<Arc<CoreBPE>>>>,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tokens `text` encodes to for `model`
    pub fn count(&self, model: &str, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.encoder(model) {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.split_whitespace().count(),
        }
    }

    fn encoder(&self, model: &str) -> Option<Arc<CoreBPE>> {
        let mut encoders = self.encoders.lock().unwrap_or_else(PoisonError::into_inner);
        encoders
            .entry(model.to_string())
            .or_insert_with(|| {
                tiktoken_rs::get_bpe_from_model(model)
                    .or_else(|_| tiktoken_rs::cl100k_base())
                    .map(Arc::new)
                    .map_err(|e| warn!(model, error = %e, "no tokenizer available, counting words"))
                    .ok()
            })
            .clone()
    }
}
