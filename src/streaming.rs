use std::sync::Arc;

use tokenizers::Tokenizer;

use crate::error::ServiceError;

/// Re-decodes the whole span per token and hands out only the new suffix.
pub struct TokenOutputStream {
    tokenizer: Arc<Tokenizer>,
    tokens: Vec<u32>,
    emitted: String,
}

impl TokenOutputStream {
    pub fn new(tokenizer: Arc<Tokenizer>) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            emitted: String::new(),
        }
    }

    pub fn next_token(&mut self, token: u32) -> Result<Option<String>, ServiceError> {
        self.tokens.push(token);
        let text = self.decode()?;
        // a trailing replacement char means a multi-byte sequence is still open
        if text.ends_with('\u{FFFD}') {
            return Ok(None);
        }
        Ok(self.take_suffix(text))
    }

    pub fn decode_rest(&mut self) -> Result<Option<String>, ServiceError> {
        let text = self.decode()?;
        Ok(self.take_suffix(text))
    }

    fn decode(&self) -> Result<String, ServiceError> {
        self.tokenizer
            .decode(&self.tokens, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }

    fn take_suffix(&mut self, text: String) -> Option<String> {
        if text.len() <= self.emitted.len() || !text.starts_with(self.emitted.as_str()) {
            return None;
        }
        let fragment = text[self.emitted.len()..].to_string();
        self.emitted = text;
        Some(fragment)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn tokenizer() -> Arc<Tokenizer> {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [
                {"id": 0, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
            ],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {"type": "WordLevel", "vocab": {"</s>": 0, "red": 1, "green": 2, "blue": 3}, "unk_token": "</s>"}
        }"#;
        Arc::new(Tokenizer::from_str(json).unwrap())
    }

    #[test]
    fn fragments_concatenate_to_full_decode() {
        let tokenizer = tokenizer();
        let ids = [1, 2, 0, 3];
        let mut stream = TokenOutputStream::new(tokenizer.clone());
        let mut streamed = String::new();
        for id in ids {
            if let Some(fragment) = stream.next_token(id).unwrap() {
                streamed.push_str(&fragment);
            }
        }
        if let Some(rest) = stream.decode_rest().unwrap() {
            streamed.push_str(&rest);
        }
        assert_eq!(streamed, tokenizer.decode(&ids, true).unwrap());
    }

    #[test]
    fn special_tokens_produce_no_fragment() {
        let mut stream = TokenOutputStream::new(tokenizer());
        assert_eq!(stream.next_token(1).unwrap().as_deref(), Some("red"));
        assert_eq!(stream.next_token(0).unwrap(), None);
        assert_eq!(stream.next_token(2).unwrap().as_deref(), Some(" green"));
        assert_eq!(stream.decode_rest().unwrap(), None);
    }
}
