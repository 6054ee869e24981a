// Name filter for candidate discovery. The same predicate is rendered as a
// Drive `q` expression for the server and re-checked locally on the results.

/// Case-insensitive name predicate: contains one of `any_of`, contains
/// `marker`, and does not contain `excluded`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFilter {
    pub any_of: Vec<String>,
    pub marker: String,
    pub excluded: String,
}

impl Default for NameFilter {
    fn default() -> Self {
        NameFilter {
            any_of: vec!["sms".into(), "calls".into()],
            marker: "xml".into(),
            excluded: "tar.gz".into(),
        }
    }
}

impl NameFilter {
    pub fn matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        let contains = |term: &str| name.contains(&term.to_lowercase());

        self.any_of.iter().any(|t| contains(t))
            && contains(&self.marker)
            && !contains(&self.excluded)
    }

    /// Render the predicate in the Drive query language.
    pub fn to_query(&self) -> String {
        let any = self
            .any_of
            .iter()
            .map(|t| format!("name contains {}", quote(t)))
            .collect::<Vec<_>>()
            .join(" or ");
        format!(
            "({}) and name contains {} and not name contains {}",
            any,
            quote(&self.marker),
            quote(&self.excluded)
        )
    }
}

fn quote(term: &str) -> String {
    let escaped = term.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}
