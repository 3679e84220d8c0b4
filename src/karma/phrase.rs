//! Thanks-phrase attribution and user references in chat bodies.

use regex::Regex;
use url::Url;

const FAST_MATCH: &str = r"(?i)\bthank(s)?\b|\+\+";

const ANCHOR: &str = r#"<a\s+href="(?P<href>[^"]*)"\s*>[^<]*</a>"#;
const PHRASE: &str = r"(thanks(\s+a\s+(lot|bunch))?|thank\s+you(\s+very\s+much)?)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRef {
    pub user_id: String,
    pub label: String,
}

fn percent_decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
        .trim()
        .to_string()
}

/// Finds who is being thanked in a formatted message.
#[derive(Debug, Clone)]
pub struct ThanksMatcher {
    fast: Regex,
    // phrase-before-mention, then mention-before-phrase
    patterns: [Regex; 2],
}

impl ThanksMatcher {
    pub fn new() -> Result<Self, regex::Error> {
        let before = format!(r"(?i){PHRASE}\s+{ANCHOR}");
        let after = format!(r"(?i){ANCHOR}(\s*:\s*)?\s*({PHRASE}|\++)");
        Ok(Self {
            fast: Regex::new(FAST_MATCH)?,
            patterns: [Regex::new(&before)?, Regex::new(&after)?],
        })
    }

    pub fn fast_match(&self, body: &str) -> bool {
        self.fast.is_match(body)
    }

    /// First anchor that names a user, trying every candidate of the first
    /// pattern before moving on to the second.
    pub fn thanked_user(&self, formatted_body: &str) -> Option<String> {
        self.patterns.iter().find_map(|pattern| {
            pattern
                .captures_iter(formatted_body)
                .find_map(|caps| caps.name("href").and_then(|h| user_from_href(h.as_str())))
        })
    }
}

/// Extracts an explicit user reference from command arguments.
#[derive(Debug, Clone)]
pub struct MentionParser {
    anchor: Regex,
    bare: Regex,
}

impl MentionParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            anchor: Regex::new(r#"(?i)<a\s+href="(?P<href>[^"]+)"\s*>(?P<label>[^<]*)</a>"#)?,
            bare: Regex::new(r"(?:^|\s)(?P<id>@[^\s:]+:\S+)")?,
        })
    }

    /// Anchor in the formatted body wins over a bare `@user:server` in the plain args.
    pub fn find(&self, args: &str, formatted_body: Option<&str>) -> Option<UserRef> {
        if let Some(html) = formatted_body {
            for caps in self.anchor.captures_iter(html) {
                let Some(user_id) = caps.name("href").and_then(|h| user_from_href(h.as_str())) else {
                    continue;
                };
                let label = caps
                    .name("label")
                    .map(|l| l.as_str().trim().to_string())
                    .filter(|l| !l.is_empty())
                    .unwrap_or_else(|| user_id.clone());
                return Some(UserRef { user_id, label });
            }
        }
        self.bare.captures(args).and_then(|caps| {
            caps.name("id").map(|m| UserRef {
                user_id: m.as_str().to_string(),
                label: m.as_str().to_string(),
            })
        })
    }
}

/// User id carried by a permalink such as `https://matrix.to/#/@bob:example.org`.
pub fn user_from_href(href: &str) -> Option<String> {
    let tail = match Url::parse(href) {
        Ok(url) => match url.fragment() {
            Some(fragment) if !fragment.trim_matches('/').is_empty() => fragment
                .trim_start_matches('/')
                .split(['/', '?'])
                .next()
                .unwrap_or_default()
                .to_string(),
            _ => url
                .path_segments()
                .and_then(|mut segs| segs.next_back().map(str::to_string))
                .unwrap_or_default(),
        },
        Err(_) => href.rsplit('/').next().unwrap_or_default().to_string(),
    };
    let user = percent_decode(&tail);
    if user.starts_with('@') && user.len() > 1 {
        Some(user)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pill(user: &str, label: &str) -> String {
        format!(r#"<a href="https://matrix.to/#/{user}">{label}</a>"#)
    }

    #[test]
    fn fast_match_is_case_insensitive_word() {
        let m = ThanksMatcher::new().unwrap();
        assert!(m.fast_match("Thanks Bob"));
        assert!(m.fast_match("thank you so much"));
        assert!(m.fast_match("bob++"));
        assert!(!m.fast_match("thanksgiving plans"));
        assert!(!m.fast_match("hello"));
    }

    #[test]
    fn phrase_before_mention() {
        let m = ThanksMatcher::new().unwrap();
        let html = format!("thanks a lot {}", pill("@bob:example.org", "Bob"));
        assert_eq!(m.thanked_user(&html).as_deref(), Some("@bob:example.org"));
    }

    #[test]
    fn mention_before_phrase() {
        let m = ThanksMatcher::new().unwrap();
        let html = format!("{}: thank you very much", pill("@carol:example.org", "Carol"));
        assert_eq!(m.thanked_user(&html).as_deref(), Some("@carol:example.org"));
        let plus = format!("{} ++", pill("@dave:example.org", "Dave"));
        assert_eq!(m.thanked_user(&plus).as_deref(), Some("@dave:example.org"));
    }

    #[test]
    fn first_target_wins() {
        let m = ThanksMatcher::new().unwrap();
        let html = format!(
            "{} thanks, and thanks {}",
            pill("@late:example.org", "Late"),
            pill("@early:example.org", "Early")
        );
        // phrase-before-mention is tried first across the whole message
        assert_eq!(m.thanked_user(&html).as_deref(), Some("@early:example.org"));

        let two = format!(
            "thanks {} and thanks {}",
            pill("@one:example.org", "One"),
            pill("@two:example.org", "Two")
        );
        assert_eq!(m.thanked_user(&two).as_deref(), Some("@one:example.org"));
    }

    #[test]
    fn percent_encoded_target_is_decoded() {
        let m = ThanksMatcher::new().unwrap();
        let html = r#"thanks <a href="https://matrix.to/#/%40bob%3Aexample.org">Bob</a>"#;
        assert_eq!(m.thanked_user(html).as_deref(), Some("@bob:example.org"));
    }

    #[test]
    fn permalink_query_and_room_links() {
        let m = ThanksMatcher::new().unwrap();
        let via = r#"thanks <a href="https://matrix.to/#/@bob:example.org?via=example.org">Bob</a>"#;
        assert_eq!(m.thanked_user(via).as_deref(), Some("@bob:example.org"));

        let room = r#"thanks <a href="https://matrix.to/#/#lobby:example.org">Lobby</a>"#;
        assert_eq!(m.thanked_user(room), None);

        // a room link is skipped in favour of a later user
        let both = format!(
            r#"thanks <a href="https://matrix.to/#/!abc:example.org">here</a> and thanks {}"#,
            pill("@carol:example.org", "Carol")
        );
        assert_eq!(m.thanked_user(&both).as_deref(), Some("@carol:example.org"));
    }

    #[test]
    fn no_mention_no_target() {
        let m = ThanksMatcher::new().unwrap();
        assert_eq!(m.thanked_user("thanks everyone"), None);
    }

    #[test]
    fn mention_parser_prefers_anchor() {
        let p = MentionParser::new().unwrap();
        let html = pill("@bob:example.org", "Bob B");
        let found = p.find("Bob B", Some(&html)).unwrap();
        assert_eq!(found.user_id, "@bob:example.org");
        assert_eq!(found.label, "Bob B");

        let bare = p.find("@carol:example.org", None).unwrap();
        assert_eq!(bare.user_id, "@carol:example.org");

        assert_eq!(p.find("", None), None);
        assert_eq!(p.find("nobody here", Some("plain text")), None);
    }

    #[test]
    fn href_parsing() {
        assert_eq!(
            user_from_href("https://matrix.to/#/@bob:example.org?via=example.org").as_deref(),
            Some("@bob:example.org")
        );
        assert_eq!(
            user_from_href("https://example.org/users/%40eve%3Aexample.org").as_deref(),
            Some("@eve:example.org")
        );
        assert_eq!(user_from_href("https://matrix.to/#/!room:example.org"), None);
    }
}
