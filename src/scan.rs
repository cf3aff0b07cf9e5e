use crate::pattern::Pattern;
use crate::source::ByteSource;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Match {
    pub start_offset: usize,
}

/// Lazy, read-only walk over every start offset whose window satisfies a
/// pattern. Overlapping matches are reported; offsets only ever increase.
pub struct Matches<'a> {
    haystack: &'a [u8],
    pattern: &'a Pattern,
    next: usize,
}

impl<'a> Iterator for Matches<'a> {
    type Item = Match;

    fn next(&mut self) -> Option<Match> {
        let len = self.pattern.len();
        if self.haystack.len() < len {
            return None;
        }
        let last = self.haystack.len() - len;

        while self.next <= last {
            let start = self.next;
            self.next += 1;
            if self.pattern.matches(&self.haystack[start..start + len]) {
                return Some(Match {
                    start_offset: start,
                });
            }
        }
        None
    }
}

pub fn scan<'a>(source: &'a ByteSource, pattern: &'a Pattern) -> Matches<'a> {
    scan_bytes(source.as_slice(), pattern)
}

pub fn scan_bytes<'a>(haystack: &'a [u8], pattern: &'a Pattern) -> Matches<'a> {
    Matches {
        haystack,
        pattern,
        next: 0,
    }
}
