//! Skip rules: patterns hiding log lines or spans of lines from activity
//! detection.
//!
//! A rule with only `from` hides each line containing `from`. A rule with
//! `from` and `to` hides a span: the line containing `from` through the
//! first following line containing `to`, inclusive. A line containing a
//! rule's `to` marker outside a span is hidden as well. Rules are tried in
//! declaration order and the first match wins.

/// One configured skip rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipRule {
    pub from: String,
    pub to: Option<String>,
}

impl SkipRule {
    pub fn line(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: None,
        }
    }

    pub fn span(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: Some(to.into()),
        }
    }
}

/// Parses `rule;rule;from|to` into skip rules. Empty entries and entries
/// with an empty `from` are dropped.
pub fn parse_skip_rules(raw: &str) -> Vec<SkipRule> {
    raw.split(';')
        .filter_map(|entry| {
            let (from, to) = match entry.split_once('|') {
                Some((from, to)) => (from, Some(to).filter(|t| !t.is_empty())),
                None => (entry, None),
            };
            if from.is_empty() {
                return None;
            }
            Some(SkipRule {
                from: from.to_string(),
                to: to.map(str::to_string),
            })
        })
        .collect()
}

/// What the first matching rule says about a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass<'r> {
    /// No rule matched.
    Candidate,
    /// Only this line is hidden.
    Hidden,
    /// A span starts here and ends at the first later line containing the
    /// given marker.
    SpanStart(&'r str),
}

/// Classifies a single line against the rules.
pub fn classify<'r>(line: &str, rules: &'r [SkipRule]) -> LineClass<'r> {
    for rule in rules {
        if line.contains(rule.from.as_str()) {
            return match &rule.to {
                Some(to) => LineClass::SpanStart(to.as_str()),
                None => LineClass::Hidden,
            };
        }
        if let Some(to) = &rule.to
            && line.contains(to.as_str())
        {
            return LineClass::Hidden;
        }
    }
    LineClass::Candidate
}

/// Iterator over the lines not hidden by any skip rule.
///
/// Empty lines are never candidates. Yields `(index, line)` with the index
/// relative to the input slice.
pub struct Candidates<'a, S> {
    lines: &'a [S],
    rules: &'a [SkipRule],
    pos: usize,
}

impl<'a, S: AsRef<str>> Candidates<'a, S> {
    pub fn new(lines: &'a [S], rules: &'a [SkipRule]) -> Self {
        Self {
            lines,
            rules,
            pos: 0,
        }
    }
}

impl<'a, S: AsRef<str>> Iterator for Candidates<'a, S> {
    type Item = (usize, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.lines.len() {
            let idx = self.pos;
            let line = self.lines[idx].as_ref();
            self.pos += 1;

            if line.is_empty() {
                continue;
            }

            match classify(line, self.rules) {
                LineClass::Candidate => return Some((idx, line)),
                LineClass::Hidden => {}
                LineClass::SpanStart(to) => {
                    // Without a closing line only the opening line is hidden.
                    if let Some(end) = self.lines[idx + 1..]
                        .iter()
                        .position(|l| l.as_ref().contains(to))
                    {
                        self.pos = idx + 1 + end + 1;
                    }
                }
            }
        }
        None
    }
}
