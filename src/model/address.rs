//! Email address lists as they appear in envelope headers (RFC 5322 §3.4).

/// One parsed mailbox from an address header.
///
/// Identity matching compares both fields exactly, so parsing must be
/// deterministic: the same header bytes always yield the same list.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EmailAddress {
    /// Human-readable display name (may be empty).
    pub display_name: String,
    /// The bare address (`user@domain`), or the raw token when unparseable.
    pub address: String,
}

impl EmailAddress {
    /// Build an address without a display name.
    pub fn bare(address: impl Into<String>) -> Self {
        Self {
            display_name: String::new(),
            address: address.into(),
        }
    }

    /// Parse a single mailbox.
    ///
    /// Accepts `user@domain`, `<user@domain>`, `Name <user@domain>`,
    /// `"Quoted, Name" <user@domain>` and the legacy `user@domain (Name)`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();

        if let (Some(open), Some(close)) = (trimmed.rfind('<'), trimmed.rfind('>')) {
            if close > open {
                return Self {
                    display_name: unquote(&trimmed[..open]),
                    address: trimmed[open + 1..close].trim().to_string(),
                };
            }
        }

        // Old-style comment form: user@domain (Full Name)
        if let (Some(open), true) = (trimmed.find('('), trimmed.ends_with(')')) {
            let address = trimmed[..open].trim();
            if !address.is_empty() {
                return Self {
                    display_name: trimmed[open + 1..trimmed.len() - 1].trim().to_string(),
                    address: address.to_string(),
                };
            }
        }

        Self::bare(trimmed)
    }

    /// Parse a comma-separated address list.
    ///
    /// Commas inside quotes, angle brackets or comments do not split. Group
    /// syntax (`team: a@b, c@d;`) is flattened into its members, and an empty
    /// group such as `undisclosed-recipients:;` yields nothing.
    pub fn parse_list(raw: &str) -> Vec<Self> {
        let mut out = Vec::new();
        for item in split_top_level(raw) {
            let item = strip_group_syntax(&item);
            if item.is_empty() {
                continue;
            }
            let addr = Self::parse(item);
            if !addr.address.is_empty() {
                out.push(addr);
            }
        }
        out
    }

    /// Whether the address carries an `@`.
    pub fn is_qualified(&self) -> bool {
        self.address.contains('@')
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.display_name.is_empty() {
            f.write_str(&self.address)
        } else {
            write!(f, "{} <{}>", self.display_name, self.address)
        }
    }
}

/// Split on commas that are not nested in quotes, `<>` or `()`.
fn split_top_level(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut angle = 0usize;
    let mut comment = 0usize;
    let mut escaped = false;

    for ch in raw.chars() {
        if escaped {
            escaped = false;
            current.push(ch);
            continue;
        }
        match ch {
            '\\' if quoted => escaped = true,
            '"' if comment == 0 => quoted = !quoted,
            '<' if !quoted => angle += 1,
            '>' if !quoted => angle = angle.saturating_sub(1),
            '(' if !quoted => comment += 1,
            ')' if !quoted => comment = comment.saturating_sub(1),
            ',' if !quoted && angle == 0 && comment == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    parts.push(current);
    parts
}

/// Drop a leading `group-name:` and a trailing `;`.
fn strip_group_syntax(item: &str) -> &str {
    let mut item = item.trim();
    if let Some(colon) = item.find(':') {
        let head = &item[..colon];
        if !head.contains('<') && !head.contains('"') && !head.contains('@') {
            item = item[colon + 1..].trim();
        }
    }
    item.trim_end_matches(';').trim()
}

/// Trim and strip surrounding double quotes, resolving `\"` escapes.
fn unquote(s: &str) -> String {
    let s = s.trim();
    match s.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").trim().to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let a = EmailAddress::parse("user@example.com");
        assert_eq!(a, EmailAddress::bare("user@example.com"));

        let b = EmailAddress::parse("User One <user1@example.com>");
        assert_eq!(b.display_name, "User One");
        assert_eq!(b.address, "user1@example.com");

        let c = EmailAddress::parse("\"Last, First\" <user@example.com>");
        assert_eq!(c.display_name, "Last, First");

        let d = EmailAddress::parse("user@example.com (Legacy Name)");
        assert_eq!(d.display_name, "Legacy Name");
        assert_eq!(d.address, "user@example.com");
    }

    #[test]
    fn test_parse_list_respects_quotes_and_comments() {
        let list = EmailAddress::parse_list(
            "\"Last, First\" <a@b.com>, c@d.com (Doe, Jane), <e@f.com>",
        );
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].address, "a@b.com");
        assert_eq!(list[1].display_name, "Doe, Jane");
        assert_eq!(list[2].address, "e@f.com");
    }

    #[test]
    fn test_parse_list_groups() {
        assert!(EmailAddress::parse_list("undisclosed-recipients:;").is_empty());
        let list = EmailAddress::parse_list("team: a@b.com, c@d.com;");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].address, "a@b.com");
        assert_eq!(list[1].address, "c@d.com");
    }

    #[test]
    fn test_display() {
        let addr = EmailAddress {
            display_name: "Alice".to_string(),
            address: "alice@example.com".to_string(),
        };
        assert_eq!(addr.to_string(), "Alice <alice@example.com>");
        assert_eq!(EmailAddress::bare("x@y").to_string(), "x@y");
    }

    #[test]
    fn test_parse_is_deterministic() {
        let raw = "A <a@x.org>, B <b@x.org>";
        assert_eq!(EmailAddress::parse_list(raw), EmailAddress::parse_list(raw));
    }
}
