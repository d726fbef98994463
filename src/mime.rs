//! Message decoding
//!
//! Turns raw RFC822 bytes into an [`EmailRecord`] using `mailparse`. Pure:
//! receives bytes, returns a record, performs no I/O. Header and body
//! decoding never fail outward; only a message that cannot be parsed at all
//! yields a [`DecodeError`], which callers replace with [`fallback_record`].

use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use tracing::warn;

use crate::errors::DecodeError;
use crate::imap::RawMessage;
use crate::models::{AnalysisState, EmailRecord};

/// Appended to a preview that was cut
pub const TRUNCATION_MARKER: &str = "...";

/// Decode one raw message into a record in the `Unanalyzed` state
///
/// # Errors
///
/// - `Malformed` if `mailparse` cannot parse the message structure
pub fn decode(raw: &RawMessage, preview_max_chars: usize) -> Result<EmailRecord, DecodeError> {
    let parsed = mailparse::parse_mail(&raw.bytes)
        .map_err(|e| DecodeError::Malformed(format!("failed to parse RFC822 message: {e}")))?;

    let subject = header_text(&parsed, "Subject");
    let sender = header_text(&parsed, "From");
    let timestamp = header_text(&parsed, "Date");
    let body = find_plain_text(&parsed).map(part_text).unwrap_or_default();

    Ok(EmailRecord {
        id: raw.uid,
        subject,
        sender,
        timestamp,
        preview: preview(&body, preview_max_chars),
        body,
        analysis: AnalysisState::Unanalyzed,
    })
}

/// Decode, or fall back to best-effort text when the structure is unreadable
pub fn decode_or_fallback(raw: &RawMessage, preview_max_chars: usize) -> EmailRecord {
    decode(raw, preview_max_chars).unwrap_or_else(|e| {
        warn!(uid = raw.uid, error = %e, "message decode failed; using raw text");
        fallback_record(raw, preview_max_chars)
    })
}

/// Best-effort record built from lossy UTF-8 text
///
/// Headers are left empty; the body is whatever follows the first blank
/// line, or the whole payload if there is none.
pub fn fallback_record(raw: &RawMessage, preview_max_chars: usize) -> EmailRecord {
    let text = String::from_utf8_lossy(&raw.bytes);
    let body = ["\r\n\r\n", "\n\n"]
        .iter()
        .find_map(|sep| text.find(sep).map(|idx| text[idx + sep.len()..].to_owned()))
        .unwrap_or_else(|| text.clone().into_owned());

    EmailRecord {
        id: raw.uid,
        subject: String::new(),
        sender: String::new(),
        timestamp: String::new(),
        preview: preview(&body, preview_max_chars),
        body,
        analysis: AnalysisState::Unanalyzed,
    }
}

/// First value of a header, decoded per RFC 2047
///
/// `mailparse` leaves encoded words it cannot decode as written, so a bad
/// charset yields the raw header text.
fn header_text(parsed: &ParsedMail<'_>, key: &str) -> String {
    parsed.headers.get_first_value(key).unwrap_or_default()
}

/// Depth-first search for the first inline `text/plain` leaf
fn find_plain_text<'p, 'a>(part: &'p ParsedMail<'a>) -> Option<&'p ParsedMail<'a>> {
    if part.subparts.is_empty() {
        return is_inline_plain_text(part).then_some(part);
    }
    part.subparts.iter().find_map(|sub| find_plain_text(sub))
}

fn is_inline_plain_text(part: &ParsedMail<'_>) -> bool {
    part.ctype.mimetype.eq_ignore_ascii_case("text/plain")
        && part.get_content_disposition().disposition != DispositionType::Attachment
}

/// Decode a part's body using its charset
///
/// Falls back to lossy UTF-8 of the transfer-decoded bytes, then to empty
/// text.
fn part_text(part: &ParsedMail<'_>) -> String {
    match part.get_body() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, charset = %part.ctype.charset, "body charset decode failed");
            part.get_body_raw()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default()
        }
    }
}

/// Body cut to `max_chars` with [`TRUNCATION_MARKER`] appended when cut
pub fn preview(body: &str, max_chars: usize) -> String {
    if body.chars().count() > max_chars {
        let mut out = truncate_chars(body, max_chars);
        out.push_str(TRUNCATION_MARKER);
        out
    } else {
        body.to_owned()
    }
}

/// Truncate string to maximum characters (Unicode-aware)
///
/// Preserves complete characters, never splitting multi-byte sequences.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::{decode, fallback_record, preview, truncate_chars};
    use crate::imap::RawMessage;
    use crate::models::AnalysisState;

    fn raw(bytes: &[u8]) -> RawMessage {
        RawMessage {
            uid: 7,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn truncates_unicode_by_character() {
        assert_eq!(truncate_chars("a😀b😀c", 4), "a😀b😀");
    }

    #[test]
    fn preview_appends_marker_only_when_cut() {
        let long = "a".repeat(600);
        let cut = preview(&long, 500);
        assert_eq!(cut.chars().count(), 503);
        assert!(cut.ends_with("..."));

        let exact = "b".repeat(500);
        assert_eq!(preview(&exact, 500), exact);
    }

    #[test]
    fn decodes_simple_plain_text_message() {
        let msg = b"From: sender@example.com\r\nTo: user@example.com\r\nSubject: Hi\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\n\r\nHello there";
        let record = decode(&raw(msg), 500).expect("decode should succeed");

        assert_eq!(record.id, 7);
        assert_eq!(record.subject, "Hi");
        assert_eq!(record.sender, "sender@example.com");
        assert_eq!(record.timestamp, "Wed, 1 Jan 2025 00:00:00 +0000");
        assert_eq!(record.body, "Hello there");
        assert_eq!(record.preview, "Hello there");
        assert_eq!(record.analysis, AnalysisState::Unanalyzed);
    }

    #[test]
    fn decodes_declared_charset_and_transfer_encoding() {
        let msg = b"Subject: Menu\r\nContent-Type: text/plain; charset=iso-8859-1\r\nContent-Transfer-Encoding: quoted-printable\r\n\r\nCaf=E9 cr=E8me";
        let record = decode(&raw(msg), 500).expect("decode should succeed");
        assert_eq!(record.body, "Café crème");
    }

    #[test]
    fn decodes_encoded_word_headers() {
        let msg = b"Subject: =?UTF-8?B?7ZqM7J2Y?=\r\nFrom: =?UTF-8?Q?Ren=C3=A9?= <rene@example.com>\r\n\r\nbody";
        let record = decode(&raw(msg), 500).expect("decode should succeed");
        assert_eq!(record.subject, "회의");
        assert_eq!(record.sender, "René <rene@example.com>");
    }

    #[test]
    fn selects_plain_part_even_when_html_comes_first() {
        let msg = concat!(
            "Subject: Alt\r\n",
            "Content-Type: multipart/alternative; boundary=\"b1\"\r\n",
            "\r\n",
            "--b1\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<p>html version</p>\r\n",
            "--b1\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "plain version\r\n",
            "--b1--\r\n",
        );
        let record = decode(&raw(msg.as_bytes()), 500).expect("decode should succeed");
        assert_eq!(record.body.trim_end(), "plain version");
    }

    #[test]
    fn never_selects_attachment_disposed_plain_text() {
        let msg = concat!(
            "Subject: Mixed\r\n",
            "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
            "\r\n",
            "--outer\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "Content-Disposition: attachment; filename=\"notes.txt\"\r\n",
            "\r\n",
            "attached notes\r\n",
            "--outer\r\n",
            "Content-Type: multipart/alternative; boundary=\"inner\"\r\n",
            "\r\n",
            "--inner\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "nested body\r\n",
            "--inner--\r\n",
            "--outer--\r\n",
        );
        let record = decode(&raw(msg.as_bytes()), 500).expect("decode should succeed");
        assert_eq!(record.body.trim_end(), "nested body");
    }

    #[test]
    fn body_is_empty_when_no_plain_text_part_exists() {
        let msg = concat!(
            "Subject: Only attachment\r\n",
            "Content-Type: multipart/mixed; boundary=\"x\"\r\n",
            "\r\n",
            "--x\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<b>hi</b>\r\n",
            "--x\r\n",
            "Content-Type: text/plain\r\n",
            "Content-Disposition: attachment; filename=\"a.txt\"\r\n",
            "\r\n",
            "file\r\n",
            "--x--\r\n",
        );
        let record = decode(&raw(msg.as_bytes()), 500).expect("decode should succeed");
        assert_eq!(record.body, "");
        assert_eq!(record.preview, "");
    }

    #[test]
    fn keeps_full_body_beside_truncated_preview() {
        let body = "x".repeat(40);
        let msg = format!("Subject: Long\r\n\r\n{body}");
        let record = decode(&raw(msg.as_bytes()), 10).expect("decode should succeed");
        assert_eq!(record.body, body);
        assert_eq!(record.preview, format!("{}...", "x".repeat(10)));
    }

    #[test]
    fn fallback_record_uses_text_after_headers() {
        let record = fallback_record(&raw(b"garbage header\r\n\r\nstill readable"), 500);
        assert_eq!(record.id, 7);
        assert_eq!(record.subject, "");
        assert_eq!(record.body, "still readable");
    }
}
