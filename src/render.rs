//! Makes single newlines in an answer survive markdown rendering without
//! touching anything inside fenced code blocks.

use once_cell::sync::Lazy;
use regex::Regex;

/// Runs of three or more backticks; fence candidates.
static BACKTICKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"`{3,}").unwrap());

/// Trailing spaces that turn a newline into a markdown hard break.
const HARD_BREAK: &str = "  ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Prose(&'a str),
    Code(&'a str),
}

/// Splits text into prose and fenced code.
///
/// A fence closes at the first later run of at least as many backticks, so
/// sequential fences are each their own block and a shorter run inside a longer
/// fence stays code. An unterminated fence runs to the end of the text, the same
/// way markdown renders it.
pub fn segments(text: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut last = 0;
    let mut open: Option<(usize, usize)> = None;

    for run in BACKTICKS.find_iter(text) {
        match open {
            None => {
                if run.start() > last {
                    out.push(Segment::Prose(&text[last..run.start()]));
                }
                open = Some((run.start(), run.len()));
            }
            Some((start, len)) if run.len() >= len => {
                out.push(Segment::Code(&text[start..run.end()]));
                last = run.end();
                open = None;
            }
            Some(_) => {}
        }
    }

    match open {
        Some((start, _)) => out.push(Segment::Code(&text[start..])),
        None if last < text.len() => out.push(Segment::Prose(&text[last..])),
        None => {}
    }
    out
}

pub fn render(text: &str) -> String {
    render_with(text, true)
}

pub fn render_with(text: &str, hard_breaks: bool) -> String {
    if !hard_breaks {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len() + text.len() / 8);
    let mut after_code = false;
    for segment in segments(text) {
        match segment {
            Segment::Code(code) => {
                out.push_str(code);
                after_code = true;
            }
            Segment::Prose(prose) => {
                break_lines(prose, after_code, &mut out);
                after_code = false;
            }
        }
    }
    out
}

fn break_lines(prose: &str, after_code: bool, out: &mut String) {
    let prose = prose.replace("\r\n", "\n");
    let chars: Vec<char> = prose.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if c == '\n' {
            let prev_newline = i > 0 && chars[i - 1] == '\n';
            let next_newline = chars.get(i + 1) == Some(&'\n');
            let closes_fence = i == 0 && after_code;
            let already_broken = out.ends_with(HARD_BREAK) || out.ends_with('\\');

            if !prev_newline && !next_newline && !closes_fence && !already_broken {
                out.push_str(HARD_BREAK);
            }
        }
        out.push(c);
    }
}
