// =============================================================================
// Order Tag Codec — intent id embedded in every broker order
// =============================================================================
//
// Tag format: "QTSW2:" + intent id (lowercase hex) + optional ":STOP" or
// ":TARGET" for protective legs. The decoder rejects anything that does not
// match exactly; a fill whose tag fails to decode is an untracked fill and
// triggers the fail-closed flatten path.
// =============================================================================

use crate::types::ExitKind;

const TAG_PREFIX: &str = "QTSW2:";

/// Encode the tag for an order.
pub fn encode_tag(intent_id: &str, protective_leg: Option<ExitKind>) -> String {
    match protective_leg {
        None => format!("{TAG_PREFIX}{intent_id}"),
        Some(ExitKind::Stop) => format!("{TAG_PREFIX}{intent_id}:STOP"),
        Some(ExitKind::Target) => format!("{TAG_PREFIX}{intent_id}:TARGET"),
    }
}

/// Decode a tag back into (intent_id, protective_leg). `None` for anything
/// that is not a well-formed tag.
pub fn decode_tag(tag: &str) -> Option<(String, Option<ExitKind>)> {
    let rest = tag.strip_prefix(TAG_PREFIX)?;

    let (id, leg) = match rest.split_once(':') {
        None => (rest, None),
        Some((id, "STOP")) => (id, Some(ExitKind::Stop)),
        Some((id, "TARGET")) => (id, Some(ExitKind::Target)),
        Some(_) => return None,
    };

    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return None;
    }
    Some((id.to_string(), leg))
}
