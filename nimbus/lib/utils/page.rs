use serde::{Deserialize, Serialize};

use crate::{NimbusError, NimbusResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// The items on this page.
    pub items: Vec<T>,

    /// The opaque token to pass back for the next page, `None` on the last page.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub next_token: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Encodes a sort key as an opaque continuation token.
pub fn encode_page_token(key: &str) -> String {
    hex::encode(key.as_bytes())
}

/// Decodes a continuation token produced by [`encode_page_token`].
pub fn decode_page_token(token: &str) -> NimbusResult<String> {
    hex::decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| NimbusError::InvalidArgument(format!("invalid page token: {token}")))
}

/// Splits an already sorted list into a page starting after the key in `token`.
///
/// `key` extracts the sort key of an item. A `limit` of `None` or `0` returns everything left.
pub fn paginate<T>(
    items: Vec<T>,
    limit: Option<usize>,
    token: Option<&str>,
    key: impl Fn(&T) -> String,
) -> NimbusResult<Page<T>> {
    let after = token.map(decode_page_token).transpose()?;
    let mut remaining = items
        .into_iter()
        .filter(|item| after.as_ref().map_or(true, |after| key(item) > *after))
        .collect::<Vec<_>>();

    let next_token = match limit {
        Some(limit) if limit > 0 && remaining.len() > limit => {
            remaining.truncate(limit);
            remaining.last().map(|item| encode_page_token(&key(item)))
        }
        _ => None,
    };

    Ok(Page {
        items: remaining,
        next_token,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
