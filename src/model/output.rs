//! Post-processing of decoded model output.
//!
//! `clean_output` drops any echoed prompt up to the last `[/INST]`, removes
//! end-of-sequence markers and trims surrounding whitespace. `FragmentFilter`
//! applies the same rules incrementally so that the concatenated fragments
//! of a stream equal the cleaned non-streaming text.

use tracing::warn;

use crate::prompt::INSTRUCTION_CLOSE;

pub const END_MARKERS: &[&str] = &["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>"];

const REPLACEMENT_CHARACTER: char = '\u{FFFD}';

pub fn clean_output(raw: &str) -> String {
    strip_markers(raw).trim().to_string()
}

fn strip_markers(raw: &str) -> String {
    let tail = raw
        .rsplit_once(INSTRUCTION_CLOSE)
        .map_or(raw, |(_, after)| after);
    let mut text = tail.to_string();
    for marker in END_MARKERS {
        if text.contains(marker) {
            text = text.replace(marker, "");
        }
    }
    text
}

/// True when `text` ends with an incomplete marker such as `</` or `[/IN`.
fn ends_with_partial_marker(text: &str) -> bool {
    END_MARKERS
        .iter()
        .chain(std::iter::once(&INSTRUCTION_CLOSE))
        .any(|marker| (1..marker.len()).any(|k| text.ends_with(&marker[..k])))
}

/// Turns successive decodes of a growing token sequence into text deltas.
///
/// Whitespace is held back until non-whitespace follows it, as are trailing
/// partial UTF-8 sequences and partial markers.
#[derive(Debug, Default)]
pub struct FragmentFilter {
    emitted: String,
}

impl FragmentFilter {
    /// Feeds the decode of everything generated so far.
    pub fn push(&mut self, decoded: &str) -> Option<String> {
        if decoded.ends_with(REPLACEMENT_CHARACTER) {
            return None;
        }
        let cleaned = clean_output(decoded);
        if ends_with_partial_marker(&cleaned) {
            return None;
        }
        self.advance(cleaned)
    }

    /// Feeds the final decode once generation has stopped, releasing any
    /// held-back text.
    pub fn finish(&mut self, decoded: &str) -> Option<String> {
        self.advance(clean_output(decoded))
    }

    fn advance(&mut self, cleaned: String) -> Option<String> {
        match cleaned.strip_prefix(self.emitted.as_str()) {
            Some("") => None,
            Some(delta) => {
                let fragment = delta.to_string();
                self.emitted = cleaned;
                Some(fragment)
            }
            None => {
                // Already-sent text cannot be retracted; resync and carry on.
                warn!(
                    emitted_len = self.emitted.len(),
                    "decoded output diverged from streamed text"
                );
                self.emitted = cleaned;
                None
            }
        }
    }
}
