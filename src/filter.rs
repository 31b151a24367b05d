use crate::rules::{FilterMode, FilterSpec, IgnoreSpec, Rule};
use crate::types::InboundMessage;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Forward,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    IgnoredUser,
    IgnoredKeyword,
    MediaType,
    FileSize,
    NotMatched,
    Blocked,
    Matched,
    NotBlocked,
    UncaptionedAlbum,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::IgnoredUser => "ignored_user",
            Reason::IgnoredKeyword => "ignored_keyword",
            Reason::MediaType => "media_type",
            Reason::FileSize => "file_size",
            Reason::NotMatched => "not_matched",
            Reason::Blocked => "blocked",
            Reason::Matched => "matched",
            Reason::NotBlocked => "not_blocked",
            Reason::UncaptionedAlbum => "uncaptioned_album",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub reason: Reason,
}

impl Decision {
    fn forwarded(reason: Reason) -> Self {
        Self {
            action: Action::Forward,
            reason,
        }
    }

    fn dropped(reason: Reason) -> Self {
        Self {
            action: Action::Drop,
            reason,
        }
    }

    pub fn is_forward(&self) -> bool {
        self.action == Action::Forward
    }
}

pub fn decide(message: &InboundMessage, rule: &Rule) -> Decision {
    if let Some(reason) = ignored(message, &rule.ignore) {
        return Decision::dropped(reason);
    }
    if let Some(reason) = media_rejection(message, &rule.filter) {
        return Decision::dropped(reason);
    }
    match_decision(message.text(), &rule.filter)
}

/// Any ignored part drops the album. Media and size limits drop it only when
/// no part satisfies them. An album without any caption passes; otherwise
/// matching runs over the combined captions.
pub fn decide_group(messages: &[InboundMessage], rule: &Rule) -> Decision {
    if let [single] = messages {
        return decide(single, rule);
    }

    for message in messages {
        if let Some(reason) = ignored(message, &rule.ignore) {
            return Decision::dropped(reason);
        }
    }

    let mut rejection = None;
    let mut any_compliant = messages.is_empty();
    for message in messages {
        match media_rejection(message, &rule.filter) {
            Some(reason) => {
                rejection.get_or_insert(reason);
            }
            None => any_compliant = true,
        }
    }
    if !any_compliant {
        if let Some(reason) = rejection {
            return Decision::dropped(reason);
        }
    }

    let combined = messages
        .iter()
        .map(|m| m.text())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if combined.is_empty() {
        return Decision::forwarded(Reason::UncaptionedAlbum);
    }
    match_decision(&combined, &rule.filter)
}

fn ignored(message: &InboundMessage, spec: &IgnoreSpec) -> Option<Reason> {
    if let Some(sender) = message.sender_id() {
        if spec.user_ids.contains(&sender) {
            return Some(Reason::IgnoredUser);
        }
    }
    let text = message.text();
    if !text.is_empty() && !spec.keywords.is_empty() {
        let lower = text.to_lowercase();
        if spec.keywords.iter().any(|k| lower.contains(k.as_str())) {
            return Some(Reason::IgnoredKeyword);
        }
    }
    None
}

fn media_rejection(message: &InboundMessage, spec: &FilterSpec) -> Option<Reason> {
    if !spec.media_types.is_empty() && !spec.media_types.contains(&message.media_kind()) {
        return Some(Reason::MediaType);
    }
    if let Some(size) = message.file_size() {
        let too_small = size < spec.min_file_size;
        let too_large = spec.max_file_size.is_some_and(|max| size > max);
        if too_small || too_large {
            return Some(Reason::FileSize);
        }
    }
    None
}

fn text_matches(text: &str, spec: &FilterSpec) -> bool {
    if text.is_empty() {
        return false;
    }
    if spec.patterns.iter().any(|p| p.is_match(text)) {
        return true;
    }
    let lower = text.to_lowercase();
    spec.keywords.iter().any(|k| lower.contains(k.as_str()))
}

fn match_decision(text: &str, spec: &FilterSpec) -> Decision {
    match spec.mode {
        // No criteria under a whitelist matches nothing.
        FilterMode::Whitelist => {
            if spec.has_match_criteria() && text_matches(text, spec) {
                Decision::forwarded(Reason::Matched)
            } else {
                Decision::dropped(Reason::NotMatched)
            }
        }
        FilterMode::Blacklist => {
            if spec.has_match_criteria() && text_matches(text, spec) {
                Decision::dropped(Reason::Blocked)
            } else {
                Decision::forwarded(Reason::NotBlocked)
            }
        }
    }
}
