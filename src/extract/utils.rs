/// Trim whitespace + strip outer quotes if present.
pub fn clean_str(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2 {
        trimmed[1..trimmed.len() - 1].trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// Drop a UTF-8 byte-order mark left by spreadsheet exports.
pub fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

/// Partition identifier for a source file: its stem, e.g. `AdventureWorks_Sales_2016`.
pub fn partition_id(path: &std::path::Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn cleans_quotes_and_padding() {
        assert_eq!(clean_str("  \" Mr. \" "), "Mr.");
        assert_eq!(clean_str("\""), "\"");
        assert_eq!(clean_str(" plain "), "plain");
    }

    #[test]
    fn strips_bom_and_names_partitions() {
        assert_eq!(strip_bom("\u{feff}Date,Day"), "Date,Day");
        assert_eq!(
            partition_id(Path::new("/mnt/bronze/Sales/AdventureWorks_Sales_2016.csv")),
            "AdventureWorks_Sales_2016"
        );
    }
}
