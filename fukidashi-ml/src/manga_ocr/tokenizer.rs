use std::path::Path;

use anyhow::{Result, anyhow};
use tokenizers::{AddedToken, Tokenizer, models::wordpiece::WordPiece};

use super::load_json;

/// WordPiece tokenizer over `vocab.txt` with every entry of `special_tokens_map.json` registered as special.
pub fn load_tokenizer(vocab_path: &Path, special_tokens_path: &Path) -> Result<Tokenizer> {
    let model = WordPiece::from_file(vocab_path.to_string_lossy().as_ref())
        .unk_token("[UNK]".to_string())
        .build()
        .map_err(|e| anyhow!(e))?;
    let mut tokenizer = Tokenizer::new(model);

    let specials: serde_json::Value = load_json(special_tokens_path)?;
    let added: Vec<AddedToken> = specials
        .as_object()
        .into_iter()
        .flat_map(|obj| obj.values())
        .filter_map(|value| value.as_str())
        .map(|token| AddedToken::from(token.to_string(), true))
        .collect();
    if !added.is_empty() {
        tokenizer.add_special_tokens(&added);
    }

    Ok(tokenizer)
}

/// Token ids to text, skipping special tokens and gluing `##` continuations.
pub fn decode(tokenizer: &Tokenizer, token_ids: &[u32]) -> Result<String> {
    let text = tokenizer
        .decode(token_ids, true)
        .map_err(|e| anyhow!("failed to decode tokens: {e}"))?;
    Ok(join_word_pieces(&text))
}

fn join_word_pieces(text: &str) -> String {
    text.replace(" ##", "")
}
