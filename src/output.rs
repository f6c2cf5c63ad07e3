//! Results output formatting (CSV).

use crate::error::Result;
use std::io::Write;

/// Write a residual history as CSV, iterations numbered from 1.
///
/// Format:
/// ```csv
/// iteration,residual
/// 1,4
/// 2,0.5
/// ```
pub fn write_history_csv<W: Write>(history: &[f64], writer: &mut W) -> Result<()> {
    writeln!(writer, "iteration,residual")?;
    for (i, residual) in history.iter().enumerate() {
        writeln!(writer, "{},{}", i + 1, residual)?;
    }
    Ok(())
}

/// Write a solution vector as CSV, one row per value.
///
/// Format:
/// ```csv
/// index,value
/// 0,1.25
/// ```
pub fn write_solution_csv<W: Write>(values: &[f64], writer: &mut W) -> Result<()> {
    writeln!(writer, "index,value")?;
    for (i, v) in values.iter().enumerate() {
        writeln!(writer, "{},{}", i, v)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_csv() {
        let mut out = Vec::new();
        write_history_csv(&[4.0, 0.5], &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "iteration,residual\n1,4\n2,0.5\n"
        );
    }

    #[test]
    fn test_empty_history_has_header() {
        let mut out = Vec::new();
        write_history_csv(&[], &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "iteration,residual\n");
    }

    #[test]
    fn test_solution_csv() {
        let mut out = Vec::new();
        write_solution_csv(&[1.25, -2.0], &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "index,value\n0,1.25\n1,-2\n"
        );
    }
}
