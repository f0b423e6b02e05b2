use anyhow::{bail, Context, Result};
use hitledger_common::{Batch, NewHit};

/// Split JSON-lines hit records into batches of at most `batch_size` rows.
/// Blank lines are skipped; a malformed line fails the whole file.
pub fn parse_batches(contents: &str, batch_size: usize) -> Result<Vec<Batch>> {
    if batch_size == 0 {
        bail!("batch size must be at least 1");
    }

    let mut batches = Vec::new();
    let mut current = Batch::default();

    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let hit: NewHit = serde_json::from_str(line)
            .with_context(|| format!("line {}: not a valid hit record", lineno + 1))?;
        current.push(hit);

        if current.len() == batch_size {
            batches.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROW: &str = r#"{"request_id":"3f2c1a8e-4b7d-4e2a-9c1f-0a1b2c3d4e5f","url":"http://intranet/a","occurred_at":"2024-06-01T12:00:00Z","username":"bob"}"#;

    #[test]
    fn splits_into_batches_and_skips_blank_lines() {
        let contents = format!("{ROW}\n\n{ROW}\n{ROW}\n");
        let batches = parse_batches(&contents, 2).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(
            batches[0].rows()[0].attributes.username.as_deref(),
            Some("bob")
        );
    }

    #[test]
    fn malformed_line_reports_its_number() {
        let contents = format!("{ROW}\n{{not json\n");
        let err = parse_batches(&contents, 10).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(parse_batches(ROW, 0).is_err());
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(parse_batches("\n  \n", 5).unwrap().is_empty());
    }
}
