//! Progress bar for interactive runs

use indicatif::{ProgressBar, ProgressStyle};

/// Bar that advances once per committed archive
pub fn commit_progress(total: u64) -> Result<ProgressBar, indicatif::style::TemplateError> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
    );
    pb.set_message("Committing archives");
    Ok(pb)
}

/// Format a record count for the final summary line
pub fn format_count(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("1 {}", noun)
    } else {
        format!("{} {}s", count, noun)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_progress() {
        let pb = commit_progress(3).unwrap();
        assert_eq!(pb.length(), Some(3));
        pb.inc(1);
        assert_eq!(pb.position(), 1);
    }

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(0, "archive"), "0 archives");
        assert_eq!(format_count(1, "archive"), "1 archive");
        assert_eq!(format_count(12, "document"), "12 documents");
    }
}
