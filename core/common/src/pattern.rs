//! Wildcard name patterns used by `find`.

/// A `*`/`?` wildcard pattern matched against a single entry name.
///
/// `*` matches any run of characters (including none), `?` matches exactly
/// one character. Matching is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    pattern: Vec<char>,
}

impl NamePattern {
    /// Compile a pattern.
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.chars().collect(),
        }
    }

    /// Whether `name` matches.
    pub fn matches(&self, name: &str) -> bool {
        let name: Vec<char> = name.chars().collect();
        let (mut p, mut n) = (0usize, 0usize);
        let mut star: Option<usize> = None;
        let mut resume = 0usize;

        while n < name.len() {
            if p < self.pattern.len() && (self.pattern[p] == '?' || self.pattern[p] == name[n]) {
                p += 1;
                n += 1;
            } else if p < self.pattern.len() && self.pattern[p] == '*' {
                star = Some(p);
                resume = n;
                p += 1;
            } else if let Some(s) = star {
                p = s + 1;
                resume += 1;
                n = resume;
            } else {
                return false;
            }
        }

        while p < self.pattern.len() && self.pattern[p] == '*' {
            p += 1;
        }
        p == self.pattern.len()
    }
}

/// Match `name` against an optional pattern; `None` matches everything.
pub fn matches_pattern(pattern: Option<&NamePattern>, name: &str) -> bool {
    pattern.map_or(true, |p| p.matches(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal() {
        let p = NamePattern::new("file.txt");
        assert!(p.matches("file.txt"));
        assert!(!p.matches("file.txt2"));
        assert!(!p.matches("File.txt"));
    }

    #[test]
    fn test_star() {
        let p = NamePattern::new("*.txt");
        assert!(p.matches("a.txt"));
        assert!(p.matches(".txt"));
        assert!(!p.matches("a.txt.bak"));
        assert!(NamePattern::new("*").matches(""));
        assert!(NamePattern::new("a*b*c").matches("aXXbYYc"));
        assert!(!NamePattern::new("a*b*c").matches("aXXbYY"));
    }

    #[test]
    fn test_question_mark() {
        let p = NamePattern::new("log?.gz");
        assert!(p.matches("log1.gz"));
        assert!(!p.matches("log.gz"));
        assert!(!p.matches("log12.gz"));
    }

    #[test]
    fn test_none_matches_everything() {
        assert!(matches_pattern(None, "anything"));
    }
}
