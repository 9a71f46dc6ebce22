//! G-code programs and the pre-flight bounds check.
//!
//! A program is dry-run against the travel bounds before a single byte is
//! sent. Only linear moves (`G0`/`G1`, including modal continuation lines)
//! are simulated. Arcs, canned cycles and the `G28`/`G30`/`G92` family are
//! skipped with a warning; programs that rely on them are not fully checked.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{GrblError, GrblResult};

/// Rectangular XY travel limits, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TravelBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Default for TravelBounds {
    fn default() -> Self {
        Self {
            min_x: -10.0,
            max_x: 10.0,
            min_y: -10.0,
            max_y: 10.0,
        }
    }
}

impl TravelBounds {
    /// Create bounds, rejecting inverted or non-finite limits.
    pub fn new(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> GrblResult<Self> {
        let all_finite = [min_x, max_x, min_y, max_y].iter().all(|v| v.is_finite());
        if !all_finite || min_x > max_x || min_y > max_y {
            return Err(GrblError::InvalidBounds(format!(
                "X[{min_x}, {max_x}] Y[{min_y}, {max_y}]"
            )));
        }
        Ok(Self {
            min_x,
            max_x,
            min_y,
            max_y,
        })
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        (self.min_x..=self.max_x).contains(&x) && (self.min_y..=self.max_y).contains(&y)
    }
}

impl std::fmt::Display for TravelBounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "X[{}, {}] Y[{}, {}]",
            self.min_x, self.max_x, self.min_y, self.max_y
        )
    }
}

/// A G-code program as the operator supplied it.
///
/// Line indices in errors and reports refer to positions in
/// [`lines`](Self::lines), counting blank and comment lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    lines: Vec<String>,
}

impl Program {
    /// Split program text on newlines.
    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Lines to transmit, with their original indices and comments removed.
    pub fn executable_lines(&self) -> impl Iterator<Item = (usize, String)> + '_ {
        self.lines
            .iter()
            .enumerate()
            .filter_map(|(i, raw)| clean_line(raw).map(|line| (i, line)))
    }
}

/// Strip comments and whitespace. `None` for lines with nothing to send.
pub fn clean_line(raw: &str) -> Option<String> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('(') || line.starts_with('%') {
        return None;
    }
    let line = match line.find(';') {
        Some(i) => line[..i].trim_end(),
        None => line,
    };
    (!line.is_empty()).then(|| line.to_string())
}

/// Letter/number pairs of a G-code line, letters uppercased.
///
/// Parenthesised comments are skipped. Words whose number fails to parse are
/// dropped.
pub fn parse_words(line: &str) -> Vec<(char, f64)> {
    let mut words = Vec::new();
    let mut chars = line.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c == '(' {
            for (_, c) in chars.by_ref() {
                if c == ')' {
                    break;
                }
            }
            continue;
        }
        if !c.is_ascii_alphabetic() {
            continue;
        }

        let start = i + c.len_utf8();
        let mut end = start;
        while let Some(&(j, d)) = chars.peek() {
            let numeric = d.is_ascii_digit() || d == '.' || d == '-' || d == '+';
            if !(numeric || (d == ' ' && end == start)) {
                break;
            }
            end = j + d.len_utf8();
            chars.next();
        }

        if let Ok(value) = line[start..end].trim().parse::<f64>() {
            words.push((c.to_ascii_uppercase(), value));
        }
    }
    words
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MotionMode {
    Linear,
    /// Arcs and canned cycles: targets are not simulated.
    Unsupported,
    /// `G80` cancelled motion.
    None,
}

/// Outcome of a successful dry run.
#[derive(Debug, Clone, PartialEq)]
pub struct DryRunReport {
    /// Linear moves that were checked.
    pub checked_moves: usize,
    /// Indices of lines whose motion could not be simulated.
    pub unchecked_lines: Vec<usize>,
    /// Simulated XY position after the last line.
    pub end: [f64; 2],
}

/// Simulate `program` from `start` and verify every XY target lies in `bounds`.
///
/// Motion mode starts absolute, as the controller puts the machine in `G90`
/// before streaming, and is toggled by `G90`/`G91`.
///
/// # Errors
///
/// Returns [`GrblError::ProgramRejected`] for the first line whose target
/// falls outside `bounds`.
pub fn dry_run(program: &Program, start: [f64; 2], bounds: &TravelBounds) -> GrblResult<DryRunReport> {
    let [mut x, mut y] = start;
    let mut absolute = true;
    let mut motion = MotionMode::Linear;
    let mut checked_moves = 0;
    let mut unchecked_lines = Vec::new();

    for (index, line) in program.executable_lines() {
        let words = parse_words(&line);
        let mut non_modal = false;

        for &(letter, value) in &words {
            if letter != 'G' {
                continue;
            }
            // G-numbers are compared in tenths so G28.1 and G92.1 stay distinct
            match (value * 10.0).round() as i64 {
                0 | 10 => motion = MotionMode::Linear,
                20 | 30 | 810..=890 => motion = MotionMode::Unsupported,
                800 => motion = MotionMode::None,
                900 => absolute = true,
                910 => absolute = false,
                280 | 281 | 300 | 301 | 920 | 921 | 922 | 923 => non_modal = true,
                _ => {}
            }
        }

        let tx = words.iter().find(|(l, _)| *l == 'X').map(|&(_, v)| v);
        let ty = words.iter().find(|(l, _)| *l == 'Y').map(|&(_, v)| v);
        if tx.is_none() && ty.is_none() {
            continue;
        }

        if non_modal || motion != MotionMode::Linear {
            if motion != MotionMode::None || non_modal {
                warn!("Dry run cannot simulate line {}: {line:?}", index + 1);
                unchecked_lines.push(index);
            }
            continue;
        }

        let (nx, ny) = if absolute {
            (tx.unwrap_or(x), ty.unwrap_or(y))
        } else {
            (x + tx.unwrap_or(0.0), y + ty.unwrap_or(0.0))
        };

        if !bounds.contains(nx, ny) {
            return Err(GrblError::ProgramRejected {
                index,
                line,
                x: nx,
                y: ny,
            });
        }
        x = nx;
        y = ny;
        checked_moves += 1;
    }

    Ok(DryRunReport {
        checked_moves,
        unchecked_lines,
        end: [x, y],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> TravelBounds {
        TravelBounds::new(0.0, 200.0, 0.0, 150.0).unwrap()
    }

    #[test]
    fn test_bounds_validation() {
        assert!(TravelBounds::new(0.0, 10.0, 0.0, 10.0).is_ok());
        assert!(matches!(
            TravelBounds::new(10.0, 0.0, 0.0, 10.0),
            Err(GrblError::InvalidBounds(_))
        ));
        assert!(TravelBounds::new(0.0, f64::NAN, 0.0, 10.0).is_err());

        let b = bounds();
        assert!(b.contains(0.0, 150.0));
        assert!(!b.contains(-0.001, 10.0));
    }

    #[test]
    fn test_clean_line() {
        assert_eq!(clean_line("  G0 X1 ; rapid"), Some("G0 X1".into()));
        assert_eq!(clean_line("(header)"), None);
        assert_eq!(clean_line("%"), None);
        assert_eq!(clean_line("   "), None);
        assert_eq!(clean_line("; only a comment"), None);
    }

    #[test]
    fn test_parse_words() {
        assert_eq!(
            parse_words("g1x10.5 Y-3 (move) F300"),
            vec![('G', 1.0), ('X', 10.5), ('Y', -3.0), ('F', 300.0)]
        );
        assert_eq!(parse_words("G0 X 5"), vec![('G', 0.0), ('X', 5.0)]);
    }

    #[test]
    fn test_program_from_text_keeps_indices() {
        let program = Program::from_text("G90\n\n(comment)\nG0 X1 Y1 ; go\n");
        let lines: Vec<_> = program.executable_lines().collect();
        assert_eq!(lines, vec![(0, "G90".to_string()), (3, "G0 X1 Y1".to_string())]);
    }

    #[test]
    fn test_rejects_out_of_bounds_absolute() {
        let program = Program::from_lines(["G90", "G0 X250 Y100"]);
        match dry_run(&program, [0.0, 0.0], &bounds()) {
            Err(GrblError::ProgramRejected { index, x, y, .. }) => {
                assert_eq!(index, 1);
                assert_eq!((x, y), (250.0, 100.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_relative_moves_accumulate() {
        let program = Program::from_lines(["G91", "G1 X60", "G1 X60", "G1 X60", "G1 X60"]);
        match dry_run(&program, [0.0, 0.0], &bounds()) {
            Err(GrblError::ProgramRejected { index, x, .. }) => {
                assert_eq!(index, 4);
                assert_eq!(x, 240.0);
            }
            other => panic!("unexpected {other:?}"),
        }

        let ok = Program::from_lines(["G91", "G1 X60 Y10", "G90", "G0 X5 Y5"]);
        let report = dry_run(&ok, [10.0, 10.0], &bounds()).unwrap();
        assert_eq!(report.checked_moves, 2);
        assert_eq!(report.end, [5.0, 5.0]);
    }

    #[test]
    fn test_modal_continuation_is_checked() {
        let program = Program::from_lines(["G1 X10 Y10 F300", "X50", "X500"]);
        assert!(matches!(
            dry_run(&program, [0.0, 0.0], &bounds()),
            Err(GrblError::ProgramRejected { index: 2, .. })
        ));
    }

    #[test]
    fn test_unsupported_motion_is_skipped_not_rejected() {
        let program = Program::from_lines([
            "G2 X500 Y500 I10 J0",
            "G92 X900 Y900",
            "G0 X10 Y10",
        ]);
        let report = dry_run(&program, [0.0, 0.0], &bounds()).unwrap();
        assert_eq!(report.unchecked_lines, vec![0, 1]);
        assert_eq!(report.checked_moves, 1);
    }

    #[test]
    fn test_z_only_lines_are_ignored() {
        let program = Program::from_lines(["G0 Z-2", "G1 Z0 F100"]);
        let report = dry_run(&program, [500.0, 500.0], &bounds()).unwrap();
        assert_eq!(report.checked_moves, 0);
        assert_eq!(report.end, [500.0, 500.0]);
    }
}
