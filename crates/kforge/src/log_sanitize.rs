//! Terminal-safe rendering of child process output.
//!
//! Kernel builds print colour codes (gcc diagnostics, `make` with
//! `KBUILD_VERBOSE`) and the odd progress bar. Lines are forwarded to the sink
//! with escape sequences and control characters removed.

const MAX_LOG_CHARS: usize = 4096;

#[derive(Clone, Copy)]
enum State {
    Text,
    Escape,
    // CSI: ESC [ ... final byte in '@'..='~'
    Csi,
    // OSC/DCS/PM/APC: terminated by BEL (OSC only) or ST (ESC \)
    Str { bel_ends: bool, saw_esc: bool },
}

pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut state = State::Text;
    let mut kept = 0usize;

    for c in input.chars() {
        state = match state {
            State::Text => {
                if c == '\x1b' {
                    State::Escape
                } else {
                    if let Some(ch) = visible(c) {
                        out.push(ch);
                        kept += 1;
                        if kept >= MAX_LOG_CHARS {
                            out.push_str(" ...[truncated]");
                            return out;
                        }
                    }
                    State::Text
                }
            }
            State::Escape => match c {
                '[' => State::Csi,
                ']' => State::Str {
                    bel_ends: true,
                    saw_esc: false,
                },
                'P' | 'X' | '^' | '_' => State::Str {
                    bel_ends: false,
                    saw_esc: false,
                },
                _ => State::Text,
            },
            State::Csi => {
                if ('@'..='~').contains(&c) {
                    State::Text
                } else {
                    State::Csi
                }
            }
            State::Str { bel_ends, saw_esc } => {
                if (bel_ends && c == '\x07') || (saw_esc && c == '\\') {
                    State::Text
                } else {
                    State::Str {
                        bel_ends,
                        saw_esc: c == '\x1b',
                    }
                }
            }
        };
    }

    out
}

fn visible(c: char) -> Option<char> {
    match c {
        '\t' => Some(' '),
        '\r' | '\n' => None,
        c if c.is_control() || is_bidi_control(c) => None,
        c => Some(c),
    }
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::sanitize_log_line;

    #[test]
    fn strips_gcc_colour_codes() {
        let input = "\u{1b}[01m\u{1b}[Kdrivers/net/foo.c:12:\u{1b}[m\u{1b}[K \u{1b}[01;31merror\u{1b}[m";
        assert_eq!(sanitize_log_line(input), "drivers/net/foo.c:12: error");
    }

    #[test]
    fn strips_title_and_dcs_sequences() {
        let input = "a\u{1b}]0;make\u{7}b\u{1b}Ppayload\u{1b}\\c";
        assert_eq!(sanitize_log_line(input), "abc");
    }

    #[test]
    fn drops_controls_and_expands_tabs() {
        assert_eq!(sanitize_log_line("  CC\tinit/main.o\r\u{202e}"), "  CC init/main.o");
    }

    #[test]
    fn truncates_runaway_lines() {
        let long = "x".repeat(10_000);
        let got = sanitize_log_line(&long);
        assert!(got.ends_with("...[truncated]"));
        assert!(got.len() < 5000);
    }
}
