//! Per-device filename workarounds.
//!
//! Some receivers reject names they should accept. Each [`Quirk`] matches a
//! destination address prefix and rewrites the outgoing object name.

use std::borrow::Cow;

/// A filename rewrite for destinations whose address starts with `prefix`.
#[derive(Debug, Clone, Copy)]
pub struct Quirk {
    /// Address prefix the rule applies to
    pub prefix: &'static str,
    /// Device family, for logs
    pub device: &'static str,
    /// Returns the replacement name, or `None` to keep the original
    pub rewrite: fn(&str) -> Option<String>,
}

/// Ordered set of quirks; the first matching prefix wins.
#[derive(Debug, Clone)]
pub struct QuirkTable {
    quirks: Vec<Quirk>,
}

impl Default for QuirkTable {
    fn default() -> Self {
        Self {
            quirks: vec![Quirk {
                prefix: "00:04:48",
                device: "Polaroid Pogo",
                rewrite: collapse_extra_dots,
            }],
        }
    }
}

impl QuirkTable {
    /// A table with no rules.
    pub const fn empty() -> Self {
        Self { quirks: Vec::new() }
    }

    /// Add a rule after the existing ones.
    #[must_use]
    pub fn with(mut self, quirk: Quirk) -> Self {
        self.quirks.push(quirk);
        self
    }

    /// Name to send for `filename` to `address`.
    pub fn apply<'a>(&self, address: &str, filename: &'a str) -> Cow<'a, str> {
        let Some(quirk) = self.quirks.iter().find(|q| address.starts_with(q.prefix)) else {
            return Cow::Borrowed(filename);
        };

        match (quirk.rewrite)(filename) {
            Some(renamed) => {
                tracing::info!(
                    "Sending \"{}\" as \"{}\" to work around {} filename handling",
                    filename,
                    renamed,
                    quirk.device
                );
                Cow::Owned(renamed)
            }
            None => Cow::Borrowed(filename),
        }
    }
}

/// Replace every '.' except the last with '_'.
fn collapse_extra_dots(filename: &str) -> Option<String> {
    let last_dot = filename.rfind('.')?;
    if !filename[..last_dot].contains('.') {
        return None;
    }

    let (stem, extension) = filename.split_at(last_dot);
    Some(format!("{}{extension}", stem.replace('.', "_")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const POGO: &str = "00:04:48:12:34:56";

    #[test]
    fn test_pogo_collapses_extra_dots() {
        let table = QuirkTable::default();
        assert_eq!(table.apply(POGO, "a.b.jpg"), "a_b.jpg");
        assert_eq!(table.apply(POGO, "x.y.z.png"), "x_y_z.png");
    }

    #[test]
    fn test_pogo_single_dot_unchanged() {
        let table = QuirkTable::default();
        assert!(matches!(table.apply(POGO, "abc.jpg"), Cow::Borrowed("abc.jpg")));
        assert_eq!(table.apply(POGO, "noextension"), "noextension");
    }

    #[test]
    fn test_other_prefix_unchanged() {
        let table = QuirkTable::default();
        assert_eq!(table.apply("00:11:22:33:44:55", "a.b.jpg"), "a.b.jpg");
        assert_eq!(table.apply("192.168.1.5", "a.b.jpg"), "a.b.jpg");
    }

    #[test]
    fn test_empty_table() {
        assert_eq!(QuirkTable::empty().apply(POGO, "a.b.jpg"), "a.b.jpg");
    }

    #[test]
    fn test_custom_rule() {
        let table = QuirkTable::empty().with(Quirk {
            prefix: "AA:BB",
            device: "test",
            rewrite: |name| Some(name.to_uppercase()),
        });
        assert_eq!(table.apply("AA:BB:CC:DD:EE:FF", "a.txt"), "A.TXT");
    }

    #[test]
    fn test_leading_dot_names() {
        assert_eq!(collapse_extra_dots(".hidden.txt"), Some("_hidden.txt".to_string()));
        assert_eq!(collapse_extra_dots(".hidden"), None);
    }
}
