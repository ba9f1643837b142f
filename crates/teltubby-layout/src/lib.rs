// Copyright 2026 The teltubby Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! C3: deterministic bucket keys and filenames. Every function here is a
//! pure function of its arguments — no I/O, no clock reads beyond the
//! timestamp the caller supplies — so the same message context always
//! produces the same prefix and filename, in-process or across runs.

use chrono::{DateTime, Datelike, Utc};

pub const DEFAULT_MAX_FILENAME_LEN: usize = 120;
pub const DEFAULT_MAX_KEY_LEN: usize = 512;

/// The subset of a message's context the layout builder needs. Resolved
/// upstream: `chat_slug_source` is already the forward-origin chat's
/// username/title, or the curator's username/id if the origin is hidden.
#[derive(Debug, Clone)]
pub struct NameContext<'a> {
    pub message_timestamp: DateTime<Utc>,
    pub message_id: i64,
    pub media_group_id: Option<&'a str>,
    pub chat_slug_source: &'a str,
    pub sender: &'a str,
    pub caption: Option<&'a str>,
}

/// `teltubby/{YYYY}/{MM}/{chat_slug}/{message_id}/`
#[must_use]
pub fn prefix_for(ctx: &NameContext<'_>) -> String {
    format!(
        "teltubby/{:04}/{:02}/{}/{}/",
        ctx.message_timestamp.year(),
        ctx.message_timestamp.month(),
        slug(ctx.chat_slug_source),
        ctx.message_id
    )
}

/// `{YYYYMMDD}-{HHMMSS}_{chat_or_source}_{sender}_m{message_id}[-g{group_id}]_{NNN}_{caption-snippet}.{ext}`,
/// capped at `max_filename_len` characters without touching the
/// extension.
#[must_use]
pub fn filename_for(ctx: &NameContext<'_>, ordinal: u32, ext: &str, max_filename_len: usize) -> String {
    let date = ctx.message_timestamp.format("%Y%m%d-%H%M%S");
    let chat_or_source = slug(ctx.chat_slug_source);
    let sender = slug(ctx.sender);
    let group_suffix = ctx
        .media_group_id
        .map(|group_id| format!("-g{group_id}"))
        .unwrap_or_default();
    let caption = caption_snippet(ctx.caption);
    let stem = format!(
        "{date}_{chat_or_source}_{sender}_m{}{group_suffix}_{ordinal:03}_{caption}",
        ctx.message_id
    );
    truncate_stem(&stem, ext, max_filename_len)
}

/// `prefix + filename`, capped at `max_key_len` by shrinking the filename
/// stem further if the combination would otherwise overflow.
#[must_use]
pub fn key_for(prefix: &str, filename: &str, max_key_len: usize) -> String {
    let key = format!("{prefix}{filename}");
    if key.chars().count() <= max_key_len {
        return key;
    }
    let budget = max_key_len.saturating_sub(prefix.chars().count());
    let (stem, ext) = split_ext(filename);
    let shortened = truncate_stem(stem, ext, budget);
    format!("{prefix}{shortened}")
}

fn truncate_stem(stem: &str, ext: &str, max_len: usize) -> String {
    let suffix = if ext.is_empty() { String::new() } else { format!(".{ext}") };
    let budget = max_len.saturating_sub(suffix.chars().count());
    let truncated: String = stem.chars().take(budget.max(1)).collect();
    let truncated = truncated.trim_end_matches('-').to_string();
    format!("{truncated}{suffix}")
}

fn split_ext(filename: &str) -> (&str, &str) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext),
        None => (filename, ""),
    }
}

/// Transliterates to ASCII, lowercases, keeps `[a-z0-9._-]`, maps
/// everything else (including runs of whitespace) to a single `-`, and
/// trims leading/trailing dashes.
#[must_use]
pub fn slug(input: &str) -> String {
    let ascii = deunicode::deunicode(input).to_lowercase();
    let mut mapped = String::with_capacity(ascii.len());
    for c in ascii.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            mapped.push(c);
        } else {
            mapped.push('-');
        }
    }
    let mut collapsed = String::with_capacity(mapped.len());
    let mut last_was_dash = false;
    for c in mapped.chars() {
        if c == '-' {
            if !last_was_dash {
                collapsed.push('-');
            }
            last_was_dash = true;
        } else {
            collapsed.push(c);
            last_was_dash = false;
        }
    }
    collapsed.trim_matches('-').to_string()
}

/// First six words of the transliterated caption, slugged as a unit. An
/// absent or empty caption yields an empty snippet.
#[must_use]
pub fn caption_snippet(caption: Option<&str>) -> String {
    match caption {
        None => String::new(),
        Some(caption) if caption.trim().is_empty() => String::new(),
        Some(caption) => {
            let ascii = deunicode::deunicode(caption);
            let words: Vec<&str> = ascii.split_whitespace().take(6).collect();
            slug(&words.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx<'a>(timestamp: DateTime<Utc>, chat: &'a str, sender: &'a str, caption: Option<&'a str>) -> NameContext<'a> {
        NameContext {
            message_timestamp: timestamp,
            message_id: 42,
            media_group_id: None,
            chat_slug_source: chat,
            sender,
            caption,
        }
    }

    #[test]
    fn prefix_uses_year_month_and_chat_slug() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 27, 10, 30, 0).unwrap();
        let c = ctx(ts, "My Café", "alice", None);
        assert_eq!(prefix_for(&c), "teltubby/2026/07/my-cafe/42/");
    }

    #[test]
    fn filename_includes_date_chat_sender_ordinal_and_caption() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 27, 10, 30, 0).unwrap();
        let c = ctx(ts, "chatname", "alice", Some("A lovely sunset over the bay today"));
        let name = filename_for(&c, 1, "jpg", DEFAULT_MAX_FILENAME_LEN);
        assert_eq!(name, "20260727-103000_chatname_alice_m42_001_a-lovely-sunset-over-the-bay.jpg");
    }

    #[test]
    fn media_group_id_adds_suffix() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 27, 10, 30, 0).unwrap();
        let mut c = ctx(ts, "chatname", "alice", None);
        c.media_group_id = Some("G1");
        let name = filename_for(&c, 2, "mp4", DEFAULT_MAX_FILENAME_LEN);
        assert!(name.contains("-g1_002_"), "unexpected filename: {name}");
    }

    #[test]
    fn filename_is_capped_at_max_len_without_corrupting_extension() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 27, 10, 30, 0).unwrap();
        let long_caption = "word ".repeat(40);
        let c = ctx(ts, "chatname", "alice", Some(&long_caption));
        let name = filename_for(&c, 1, "jpg", 30);
        assert!(name.len() <= 30, "name too long: {name} ({})", name.len());
        assert!(name.ends_with(".jpg"));
    }

    #[test]
    fn key_is_capped_at_max_key_len() {
        let prefix = "teltubby/2026/07/a-very-long-chat-slug-name-indeed/42/";
        let long_name = format!("{}.jpg", "x".repeat(400));
        let key = key_for(prefix, &long_name, DEFAULT_MAX_KEY_LEN);
        assert!(key.chars().count() <= DEFAULT_MAX_KEY_LEN);
        assert!(key.ends_with(".jpg"));
    }

    #[test]
    fn slug_collapses_runs_and_trims_edges() {
        assert_eq!(slug("  Hello,   World!! "), "hello-world");
    }

    #[test]
    fn caption_snippet_takes_first_six_words() {
        assert_eq!(
            caption_snippet(Some("one two three four five six seven eight")),
            "one-two-three-four-five-six"
        );
    }

    #[test]
    fn caption_snippet_empty_when_absent() {
        assert_eq!(caption_snippet(None), "");
        assert_eq!(caption_snippet(Some("   ")), "");
    }
}
