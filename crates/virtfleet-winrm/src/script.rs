//! Utility functions that build common PowerShell script fragments.

/// Script-fragment helpers shared by the management crates.
pub struct PsScripts;

impl PsScripts {
    /// Escape a string value for embedding inside single-quoted PS strings.
    pub fn escape(s: &str) -> String {
        s.replace('\'', "''")
    }

    /// Suffix that serializes pipeline output as typed-property XML.
    pub fn to_xml() -> &'static str {
        "| ConvertTo-Xml -as String"
    }

    /// Suffix that serializes pipeline output as compact JSON.
    pub fn to_json(depth: u32) -> String {
        format!("| ConvertTo-Json -Depth {} -Compress", depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_single_quotes() {
        assert_eq!(PsScripts::escape("O'Brien"), "O''Brien");
        assert_eq!(PsScripts::escape("plain"), "plain");
    }

    #[test]
    fn test_to_json_suffix() {
        assert_eq!(PsScripts::to_json(3), "| ConvertTo-Json -Depth 3 -Compress");
    }
}
