use std::sync::LazyLock;

use regex::Regex;

use crate::{NimbusError, NimbusResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The longest volume name accepted.
pub const MAX_VOLUME_NAME_LEN: usize = 63;

static VOLUME_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]{0,62}$").expect("volume name pattern is valid"));

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks a volume name: a lowercase letter followed by lowercase letters, digits or hyphens, at
/// most 63 characters in total.
pub fn validate_volume_name(name: &str) -> NimbusResult<()> {
    if VOLUME_NAME.is_match(name) {
        Ok(())
    } else {
        Err(NimbusError::InvalidVolumeName(name.to_string()))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_volume_name() {
        for name in ["abc", "a", "data-2024", "x-y-z"] {
            assert!(validate_volume_name(name).is_ok(), "{name}");
        }

        let longest = format!("a{}", "b".repeat(MAX_VOLUME_NAME_LEN - 1));
        assert!(validate_volume_name(&longest).is_ok());

        let too_long = format!("a{}", "b".repeat(MAX_VOLUME_NAME_LEN));
        for name in ["", "1abc", "-abc", "Abc", "ab_c", "ab c", "ab.c", too_long.as_str()] {
            assert!(
                matches!(
                    validate_volume_name(name),
                    Err(NimbusError::InvalidVolumeName(_))
                ),
                "{name}"
            );
        }
    }
}
