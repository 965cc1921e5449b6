// Luno Pattern Matching
// The string-library pattern engine: byte-oriented classes, sets,
// captures, balance and frontier items. Patterns are not regular
// expressions; there is no alternation and quantifiers apply to a
// single item only.

use smallvec::SmallVec;
use thiserror::Error;

/// Captures one pattern may hold.
pub const MAX_CAPTURES: usize = 32;

/// Recursion bound for the backtracking matcher.
const MAX_MATCH_DEPTH: usize = 220;

const CAP_UNFINISHED: isize = -1;
const CAP_POSITION: isize = -2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("malformed pattern (ends with '%')")]
    EndsWithPercent,
    #[error("malformed pattern (missing ']')")]
    MissingBracket,
    #[error("missing '[' after '%f' in pattern")]
    MissingFrontier,
    #[error("malformed pattern (missing arguments to '%b')")]
    MissingBalance,
    #[error("invalid capture index %{0}")]
    InvalidCapture(usize),
    #[error("invalid pattern capture")]
    UnmatchedParen,
    #[error("too many captures")]
    TooManyCaptures,
    #[error("pattern too complex")]
    TooComplex,
}

/// One capture of a completed match, in byte offsets of the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    Str { start: usize, end: usize },
    /// A position capture `()`: the offset where it matched.
    Pos(usize),
}

/// A completed match: the span of the whole match plus its captures.
#[derive(Debug, Clone)]
pub struct Match {
    pub start: usize,
    pub end: usize,
    pub captures: SmallVec<[Capture; 4]>,
}

impl Match {
    /// Capture `i` (zero-based), defaulting to the whole match when the
    /// pattern has no explicit captures and `i` is 0.
    pub fn capture(&self, i: usize) -> Option<Capture> {
        if self.captures.is_empty() && i == 0 {
            return Some(Capture::Str { start: self.start, end: self.end });
        }
        self.captures.get(i).copied()
    }

    pub fn capture_count(&self) -> usize {
        self.captures.len().max(1)
    }
}

/// Find the first match of `pat` in `src` at or after byte `init`.
/// A leading `^` anchors the pattern to `init`.
pub fn find(src: &[u8], pat: &[u8], init: usize) -> Result<Option<Match>, PatternError> {
    let anchored = pat.first() == Some(&b'^');
    let p_start = if anchored { 1 } else { 0 };
    let mut s = init.min(src.len());
    loop {
        let mut ms = MatchState::new(src, pat);
        if let Some(end) = ms.do_match(s, p_start)? {
            return Ok(Some(ms.finish(s, end)));
        }
        if anchored || s >= src.len() {
            return Ok(None);
        }
        s += 1;
    }
}

/// Whether `pat` contains any pattern-special byte; plain substring
/// search suffices when it does not.
pub fn has_specials(pat: &[u8]) -> bool {
    pat.iter()
        .any(|b| matches!(b, b'^' | b'$' | b'*' | b'+' | b'?' | b'.' | b'(' | b')' | b'[' | b']' | b'%' | b'-'))
}

#[derive(Debug, Clone, Copy)]
struct CapState {
    start: usize,
    /// Byte length, or CAP_UNFINISHED / CAP_POSITION.
    len: isize,
}

struct MatchState<'a> {
    src: &'a [u8],
    pat: &'a [u8],
    caps: SmallVec<[CapState; 8]>,
    depth: usize,
}

impl<'a> MatchState<'a> {
    fn new(src: &'a [u8], pat: &'a [u8]) -> Self {
        Self {
            src,
            pat,
            caps: SmallVec::new(),
            depth: 0,
        }
    }

    fn finish(&self, start: usize, end: usize) -> Match {
        let captures = self
            .caps
            .iter()
            .map(|c| {
                if c.len == CAP_POSITION {
                    Capture::Pos(c.start)
                } else {
                    Capture::Str { start: c.start, end: c.start + c.len.max(0) as usize }
                }
            })
            .collect();
        Match { start, end, captures }
    }

    /// Index one past the single pattern item starting at `p`.
    fn class_end(&self, p: usize) -> Result<usize, PatternError> {
        match self.pat[p] {
            b'%' => {
                if p + 1 >= self.pat.len() {
                    return Err(PatternError::EndsWithPercent);
                }
                Ok(p + 2)
            }
            b'[' => {
                let mut q = p + 1;
                if self.pat.get(q) == Some(&b'^') {
                    q += 1;
                }
                // The first ']' of a set is a literal member.
                loop {
                    if q >= self.pat.len() {
                        return Err(PatternError::MissingBracket);
                    }
                    let c = self.pat[q];
                    q += 1;
                    if c == b'%' {
                        if q >= self.pat.len() {
                            return Err(PatternError::MissingBracket);
                        }
                        q += 1;
                    }
                    if self.pat.get(q) == Some(&b']') {
                        return Ok(q + 1);
                    }
                }
            }
            _ => Ok(p + 1),
        }
    }

    /// `[set]` membership; `p` points at '[', `ec` at the closing ']'.
    fn match_set(&self, c: u8, mut p: usize, ec: usize) -> bool {
        let mut negate = false;
        p += 1;
        if self.pat[p] == b'^' {
            negate = true;
            p += 1;
        }
        while p < ec {
            if self.pat[p] == b'%' {
                p += 1;
                if match_class(c, self.pat[p]) {
                    return !negate;
                }
                p += 1;
            } else if p + 2 < ec && self.pat[p + 1] == b'-' {
                if self.pat[p] <= c && c <= self.pat[p + 2] {
                    return !negate;
                }
                p += 3;
            } else {
                if self.pat[p] == c {
                    return !negate;
                }
                p += 1;
            }
        }
        negate
    }

    /// Does the subject byte at `s` match the single item at `p..ep`?
    fn single_match(&self, s: usize, p: usize, ep: usize) -> bool {
        if s >= self.src.len() {
            return false;
        }
        let c = self.src[s];
        match self.pat[p] {
            b'.' => true,
            b'%' => match_class(c, self.pat[p + 1]),
            b'[' => self.match_set(c, p, ep - 1),
            literal => literal == c,
        }
    }

    fn do_match(&mut self, s: usize, p: usize) -> Result<Option<usize>, PatternError> {
        self.depth += 1;
        if self.depth > MAX_MATCH_DEPTH {
            return Err(PatternError::TooComplex);
        }
        let result = self.do_match_inner(s, p);
        self.depth -= 1;
        result
    }

    fn do_match_inner(&mut self, mut s: usize, mut p: usize) -> Result<Option<usize>, PatternError> {
        loop {
            if p >= self.pat.len() {
                return Ok(Some(s));
            }
            match self.pat[p] {
                b'(' => {
                    return if self.pat.get(p + 1) == Some(&b')') {
                        self.start_capture(s, p + 2, CAP_POSITION)
                    } else {
                        self.start_capture(s, p + 1, CAP_UNFINISHED)
                    };
                }
                b')' => return self.end_capture(s, p + 1),
                b'$' if p + 1 == self.pat.len() => {
                    return Ok(if s == self.src.len() { Some(s) } else { None });
                }
                b'%' => match self.pat.get(p + 1).copied() {
                    Some(b'b') => {
                        match self.match_balance(s, p + 2)? {
                            Some(next) => {
                                s = next;
                                p += 4;
                                continue;
                            }
                            None => return Ok(None),
                        }
                    }
                    Some(b'f') => {
                        p += 2;
                        if self.pat.get(p) != Some(&b'[') {
                            return Err(PatternError::MissingFrontier);
                        }
                        let ep = self.class_end(p)?;
                        let prev = if s == 0 { 0 } else { self.src[s - 1] };
                        let cur = if s < self.src.len() { self.src[s] } else { 0 };
                        if !self.match_set(prev, p, ep - 1) && self.match_set(cur, p, ep - 1) {
                            p = ep;
                            continue;
                        }
                        return Ok(None);
                    }
                    Some(d) if d.is_ascii_digit() => {
                        match self.match_capture(s, d)? {
                            Some(next) => {
                                s = next;
                                p += 2;
                                continue;
                            }
                            None => return Ok(None),
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
            // A single item, possibly quantified.
            let ep = self.class_end(p)?;
            let matched = self.single_match(s, p, ep);
            match self.pat.get(ep).copied() {
                Some(b'?') => {
                    if matched {
                        if let Some(end) = self.do_match(s + 1, ep + 1)? {
                            return Ok(Some(end));
                        }
                    }
                    p = ep + 1;
                }
                Some(b'+') => {
                    return if matched {
                        self.max_expand(s + 1, p, ep)
                    } else {
                        Ok(None)
                    };
                }
                Some(b'*') => return self.max_expand(s, p, ep),
                Some(b'-') => return self.min_expand(s, p, ep),
                _ => {
                    if !matched {
                        return Ok(None);
                    }
                    s += 1;
                    p = ep;
                }
            }
        }
    }

    /// Greedy expansion: take as many as possible, backtrack one at a
    /// time until the rest of the pattern matches.
    fn max_expand(&mut self, s: usize, p: usize, ep: usize) -> Result<Option<usize>, PatternError> {
        let mut count = 0;
        while self.single_match(s + count, p, ep) {
            count += 1;
        }
        loop {
            if let Some(end) = self.do_match(s + count, ep + 1)? {
                return Ok(Some(end));
            }
            if count == 0 {
                return Ok(None);
            }
            count -= 1;
        }
    }

    /// Lazy expansion: try the rest first, consume one item on failure.
    fn min_expand(&mut self, mut s: usize, p: usize, ep: usize) -> Result<Option<usize>, PatternError> {
        loop {
            if let Some(end) = self.do_match(s, ep + 1)? {
                return Ok(Some(end));
            }
            if self.single_match(s, p, ep) {
                s += 1;
            } else {
                return Ok(None);
            }
        }
    }

    fn start_capture(
        &mut self,
        s: usize,
        p: usize,
        what: isize,
    ) -> Result<Option<usize>, PatternError> {
        if self.caps.len() >= MAX_CAPTURES {
            return Err(PatternError::TooManyCaptures);
        }
        self.caps.push(CapState { start: s, len: what });
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.caps.pop();
        }
        Ok(result)
    }

    fn end_capture(&mut self, s: usize, p: usize) -> Result<Option<usize>, PatternError> {
        let idx = self
            .caps
            .iter()
            .rposition(|c| c.len == CAP_UNFINISHED)
            .ok_or(PatternError::UnmatchedParen)?;
        self.caps[idx].len = (s - self.caps[idx].start) as isize;
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.caps[idx].len = CAP_UNFINISHED;
        }
        Ok(result)
    }

    /// `%1`-`%9`: match the text of an earlier capture again.
    fn match_capture(&mut self, s: usize, d: u8) -> Result<Option<usize>, PatternError> {
        let index = (d - b'0') as usize;
        if index == 0 || index > self.caps.len() {
            return Err(PatternError::InvalidCapture(index));
        }
        let cap = self.caps[index - 1];
        if cap.len < 0 {
            return Err(PatternError::InvalidCapture(index));
        }
        let len = cap.len as usize;
        if self.src.len() - s >= len
            && self.src[cap.start..cap.start + len] == self.src[s..s + len]
        {
            Ok(Some(s + len))
        } else {
            Ok(None)
        }
    }

    /// `%bxy`: a balanced run starting with `x` and ending with the
    /// matching `y`.
    fn match_balance(&mut self, s: usize, p: usize) -> Result<Option<usize>, PatternError> {
        if p + 1 >= self.pat.len() {
            return Err(PatternError::MissingBalance);
        }
        if s >= self.src.len() || self.src[s] != self.pat[p] {
            return Ok(None);
        }
        let open = self.pat[p];
        let close = self.pat[p + 1];
        let mut balance = 1;
        let mut i = s + 1;
        while i < self.src.len() {
            if self.src[i] == close {
                balance -= 1;
                if balance == 0 {
                    return Ok(Some(i + 1));
                }
            } else if self.src[i] == open {
                balance += 1;
            }
            i += 1;
        }
        Ok(None)
    }
}

fn match_class(c: u8, class: u8) -> bool {
    let result = match class.to_ascii_lowercase() {
        b'a' => c.is_ascii_alphabetic(),
        b'c' => c.is_ascii_control(),
        b'd' => c.is_ascii_digit(),
        b'g' => c.is_ascii_graphic(),
        b'l' => c.is_ascii_lowercase(),
        b'p' => c.is_ascii_punctuation(),
        b's' => c.is_ascii_whitespace(),
        b'u' => c.is_ascii_uppercase(),
        b'w' => c.is_ascii_alphanumeric(),
        b'x' => c.is_ascii_hexdigit(),
        _ => return c == class,
    };
    // An uppercase class letter is the complement.
    if class.is_ascii_uppercase() {
        !result
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(src: &str, pat: &str) -> Option<(usize, usize)> {
        find(src.as_bytes(), pat.as_bytes(), 0)
            .unwrap()
            .map(|m| (m.start, m.end))
    }

    fn cap_text(src: &str, pat: &str, i: usize) -> String {
        let found = find(src.as_bytes(), pat.as_bytes(), 0).unwrap().unwrap();
        match found.capture(i).unwrap() {
            Capture::Str { start, end } => src[start..end].to_string(),
            Capture::Pos(p) => format!("@{}", p),
        }
    }

    #[test]
    fn literal_and_classes() {
        assert_eq!(m("hello world", "world"), Some((6, 11)));
        assert_eq!(m("abc123", "%d+"), Some((3, 6)));
        assert_eq!(m("abc123", "%a+"), Some((0, 3)));
        assert_eq!(m("  x", "%S"), Some((2, 3)));
        assert_eq!(m("abc", "%d"), None);
    }

    #[test]
    fn anchors() {
        assert_eq!(m("hello", "^hel"), Some((0, 3)));
        assert_eq!(m("hello", "^ell"), None);
        assert_eq!(m("hello", "llo$"), Some((2, 5)));
        assert_eq!(m("hello", "hel$"), None);
        assert_eq!(m("x", "^x$"), Some((0, 1)));
    }

    #[test]
    fn sets_and_ranges() {
        assert_eq!(m("foo42", "[0-9]+"), Some((3, 5)));
        assert_eq!(m("foo42", "[^0-9]+"), Some((0, 3)));
        assert_eq!(m("a]b", "[%]]"), Some((1, 2)));
        assert_eq!(m("a]b", "[]]"), Some((1, 2)));
    }

    #[test]
    fn quantifiers() {
        assert_eq!(m("aaa", "a*"), Some((0, 3)));
        assert_eq!(m("baaa", "a*"), Some((0, 0)), "star matches empty at start");
        assert_eq!(m("<a><b>", "<.->"), Some((0, 3)), "lazy stops early");
        assert_eq!(m("<a><b>", "<.*>"), Some((0, 6)), "greedy goes long");
        assert_eq!(m("color colour", "colou?r"), Some((0, 5)));
    }

    #[test]
    fn captures() {
        assert_eq!(cap_text("key=value", "(%w+)=(%w+)", 0), "key");
        assert_eq!(cap_text("key=value", "(%w+)=(%w+)", 1), "value");
    }

    #[test]
    fn capture_pairs() {
        let found = find(b"key=value", b"(%w+)=(%w+)", 0).unwrap().unwrap();
        assert_eq!(found.captures.len(), 2);
        assert_eq!(found.capture(0), Some(Capture::Str { start: 0, end: 3 }));
        assert_eq!(found.capture(1), Some(Capture::Str { start: 4, end: 9 }));
    }

    #[test]
    fn position_capture() {
        let found = find(b"abc", b"b()", 0).unwrap().unwrap();
        assert_eq!(found.capture(0), Some(Capture::Pos(2)));
    }

    #[test]
    fn whole_match_is_default_capture() {
        let found = find(b"hello", b"l+", 0).unwrap().unwrap();
        assert_eq!(found.capture(0), Some(Capture::Str { start: 2, end: 4 }));
    }

    #[test]
    fn backreference() {
        assert_eq!(m("abcabc", "(abc)%1"), Some((0, 6)));
        assert_eq!(m("abcabd", "(abc)%1"), None);
    }

    #[test]
    fn balance() {
        assert_eq!(m("(a(b)c)d", "%b()"), Some((0, 7)));
        assert_eq!(m("(unclosed", "%b()"), None);
    }

    #[test]
    fn frontier() {
        // Word boundary before "world".
        assert_eq!(m("helloworld", "%f[%u]"), None);
        assert_eq!(m("helloWorld", "%f[%u]%a+"), Some((5, 10)));
        assert_eq!(m("THE (quick) fox", "%f[%a]%a+"), Some((0, 3)));
    }

    #[test]
    fn find_from_offset() {
        let found = find(b"aXaX", b"X", 2).unwrap().unwrap();
        assert_eq!((found.start, found.end), (3, 4));
    }

    #[test]
    fn malformed_patterns() {
        assert_eq!(
            find(b"x", b"%", 0).unwrap_err(),
            PatternError::EndsWithPercent
        );
        assert_eq!(
            find(b"x", b"[abc", 0).unwrap_err(),
            PatternError::MissingBracket
        );
        assert_eq!(
            find(b"x", b"%f%a", 0).unwrap_err(),
            PatternError::MissingFrontier
        );
        assert_eq!(
            find(b"aa", b"(a)%2", 0).unwrap_err(),
            PatternError::InvalidCapture(2)
        );
    }

    #[test]
    fn plain_detection() {
        assert!(!has_specials(b"hello world"));
        assert!(has_specials(b"%d+"));
        assert!(has_specials(b"a-b"));
    }
}
