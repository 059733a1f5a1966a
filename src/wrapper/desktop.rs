//! Rewriting of desktop-entry command lines.
//!
//! `Exec=` and `TryExec=` lines are taken apart into directive key, command and
//! trailing field codes, then rebuilt with the container-engine prefix (and any
//! per-application flags) inserted between command and field codes. Everything
//! else passes through unchanged.

/// A decomposed `Exec=`/`TryExec=` line.
#[derive(Debug, PartialEq, Eq)]
pub struct ExecLine<'a> {
    /// Leading whitespace, key, assignment operator and surrounding spacing.
    head: &'a str,
    /// The command with its arguments, trailing field codes stripped.
    command: &'a str,
    /// Trailing `%X` field codes in their original order.
    field_codes: Vec<&'a str>,
}

/// Parse a desktop-entry line; `None` for anything that is not an `Exec=` or
/// `TryExec=` directive with a non-empty command.
pub fn parse(line: &str) -> Option<ExecLine<'_>> {
    let eq = line.find('=')?;
    let key = line[..eq].trim();
    if key != "Exec" && key != "TryExec" {
        return None;
    }
    let value = &line[eq + 1..];
    let offset = value.find(|c: char| !c.is_whitespace())?;
    let head = &line[..eq + 1 + offset];
    let mut command = line[eq + 1 + offset..].trim_end();
    let mut field_codes = Vec::new();
    while let Some((before, code)) = split_trailing_field_code(command) {
        field_codes.push(code);
        command = before.trim_end();
    }
    if command.is_empty() {
        return None;
    }
    field_codes.reverse();
    Some(ExecLine {
        head,
        command,
        field_codes,
    })
}

/// Split off a single trailing `%X` token, which must be separated from the
/// rest by whitespace so a command that itself is `%X`-like stays intact.
fn split_trailing_field_code(s: &str) -> Option<(&str, &str)> {
    let mut chars = s.char_indices().rev();
    let (_, last) = chars.next()?;
    let (pct_idx, pct) = chars.next()?;
    let (ws_idx, ws) = chars.next()?;
    if last.is_ascii_alphabetic() && pct == '%' && ws.is_whitespace() {
        Some((&s[..ws_idx], &s[pct_idx..]))
    } else {
        None
    }
}

impl ExecLine<'_> {
    /// Rebuild the line with the given prefix before the command and extra
    /// flags between command and field codes.
    pub fn render(&self, prefix: &str, flags: &str) -> String {
        let mut out = format!("{}{} {}", self.head, prefix, self.command);
        if !flags.is_empty() {
            out.push(' ');
            out.push_str(flags);
        }
        for code in &self.field_codes {
            out.push(' ');
            out.push_str(code);
        }
        out
    }
}

/// Rewrite one line of a desktop file; non-directive lines come back unchanged.
pub fn rewrite_exec_line(line: &str, prefix: &str, flags: &str) -> String {
    match parse(line) {
        Some(exec) => exec.render(prefix, flags),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "podman exec -it arch1";

    #[test]
    fn test_exec_line_with_field_code() {
        assert_eq!(
            rewrite_exec_line("Exec=vlc %U", PREFIX, ""),
            "Exec=podman exec -it arch1 vlc %U"
        );
    }

    #[test]
    fn test_tryexec_line() {
        assert_eq!(
            rewrite_exec_line("TryExec=vlc", PREFIX, ""),
            "TryExec=podman exec -it arch1 vlc"
        );
    }

    #[test]
    fn test_multiple_trailing_field_codes_keep_order() {
        assert_eq!(
            rewrite_exec_line("Exec=gimp %f %u", PREFIX, ""),
            "Exec=podman exec -it arch1 gimp %f %u"
        );
    }

    #[test]
    fn test_flags_inserted_before_field_codes() {
        assert_eq!(
            rewrite_exec_line("Exec=firefox %u", PREFIX, "--new-instance"),
            "Exec=podman exec -it arch1 firefox --new-instance %u"
        );
    }

    #[test]
    fn test_spacing_around_assignment_preserved() {
        assert_eq!(
            rewrite_exec_line("  Exec = vlc  ", PREFIX, ""),
            "  Exec = podman exec -it arch1 vlc"
        );
    }

    #[test]
    fn test_command_arguments_kept_verbatim() {
        assert_eq!(
            rewrite_exec_line("Exec=sh -c \"vlc --started-from-file\" %U", PREFIX, ""),
            "Exec=podman exec -it arch1 sh -c \"vlc --started-from-file\" %U"
        );
    }

    #[test]
    fn test_non_directive_lines_unchanged() {
        for line in [
            "[Desktop Entry]",
            "Name=VLC media player",
            "Icon=vlc",
            "# Exec=commented out",
            "",
        ] {
            assert_eq!(rewrite_exec_line(line, PREFIX, ""), line);
        }
    }

    #[test]
    fn test_empty_exec_value_left_alone() {
        assert_eq!(rewrite_exec_line("Exec=", PREFIX, ""), "Exec=");
        assert_eq!(rewrite_exec_line("Exec=   ", PREFIX, ""), "Exec=   ");
    }

    #[test]
    fn test_parse_decomposition() {
        let exec = parse("Exec=mpv --fs %F %U").unwrap();
        assert_eq!(exec.command, "mpv --fs");
        assert_eq!(exec.field_codes, ["%F", "%U"]);
    }
}
