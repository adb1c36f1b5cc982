use serde_derive::Deserialize;
use std::fmt;
use std::path::Path;

/// A single tag match rule: key must be present, and if a value is given it
/// must match exactly.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TagClause {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl TagClause {
    /// Parses the symbolic form used on the command line: `key=value` or
    /// bare `key` (key present, any value).
    pub fn parse(spec: &str) -> Result<TagClause, FilterError> {
        let spec = spec.trim();
        match spec.find('=') {
            Some(0) => Err(FilterError::BadClause(spec.to_string())),
            Some(idx) => Ok(TagClause {
                key: spec[..idx].to_string(),
                value: Some(spec[idx + 1..].to_string()),
            }),
            None => {
                if spec.is_empty() {
                    Err(FilterError::BadClause(spec.to_string()))
                } else {
                    Ok(TagClause {
                        key: spec.to_string(),
                        value: None,
                    })
                }
            }
        }
    }

    fn matches(&self, k: &str, v: &str) -> bool {
        if k != self.key {
            return false;
        }
        match &self.value {
            Some(want) => want == v,
            None => true,
        }
    }
}

impl fmt::Display for TagClause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}", self.key, v),
            None => write!(f, "{}", self.key),
        }
    }
}

/// Tag predicate over a way's tag set: an OR across clauses. Stateless, so
/// it can be shared freely across decode shards.
#[derive(Clone, Debug)]
pub struct TagFilter {
    clauses: Vec<TagClause>,
}

impl TagFilter {
    pub fn new(clauses: Vec<TagClause>) -> Result<TagFilter, FilterError> {
        if clauses.is_empty() {
            return Err(FilterError::Empty);
        }
        Ok(TagFilter { clauses })
    }

    /// Loads clauses from a YAML file: a list of `{key, value?}` entries.
    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Vec<TagClause>, FilterError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn matches<'a, I>(&self, tags: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        tags.into_iter()
            .any(|(k, v)| self.clauses.iter().any(|clause| clause.matches(k, v)))
    }

    pub fn clauses(&self) -> &[TagClause] {
        &self.clauses
    }
}

#[derive(Debug)]
pub enum FilterError {
    Empty,
    BadClause(String),
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FilterError::Empty => write!(f, "no filter clauses given"),
            FilterError::BadClause(spec) => {
                write!(f, "bad filter clause {:?} (expected key or key=value)", spec)
            }
            FilterError::Io(e) => write!(f, "could not read filter file: {}", e),
            FilterError::Yaml(e) => write!(f, "could not parse filter file: {}", e),
        }
    }
}

impl std::error::Error for FilterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FilterError::Io(e) => Some(e),
            FilterError::Yaml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FilterError {
    fn from(e: std::io::Error) -> FilterError {
        FilterError::Io(e)
    }
}

impl From<serde_yaml::Error> for FilterError {
    fn from(e: serde_yaml::Error) -> FilterError {
        FilterError::Yaml(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn filter(specs: &[&str]) -> TagFilter {
        TagFilter::new(
            specs
                .iter()
                .map(|s| TagClause::parse(s).unwrap())
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn parse_key_value() {
        let clause = TagClause::parse("highway=construction").unwrap();
        assert_eq!(clause.key, "highway");
        assert_eq!(clause.value.as_deref(), Some("construction"));
    }

    #[test]
    fn parse_bare_key() {
        let clause = TagClause::parse("bridge").unwrap();
        assert_eq!(clause.key, "bridge");
        assert_eq!(clause.value, None);
    }

    #[test]
    fn parse_rejects_empty() {
        assert!(TagClause::parse("").is_err());
        assert!(TagClause::parse("=construction").is_err());
    }

    #[test]
    fn empty_filter_rejected() {
        assert!(TagFilter::new(vec![]).is_err());
    }

    #[test]
    fn matches_key_value() {
        let f = filter(&["highway=construction"]);
        assert!(f.matches(vec![("highway", "construction")]));
        assert!(!f.matches(vec![("highway", "residential")]));
        assert!(!f.matches(vec![("building", "yes")]));
        assert!(!f.matches(Vec::<(&str, &str)>::new()));
    }

    #[test]
    fn matches_bare_key() {
        let f = filter(&["construction"]);
        assert!(f.matches(vec![("construction", "minor")]));
        assert!(f.matches(vec![("construction", "")]));
        assert!(!f.matches(vec![("highway", "construction")]));
    }

    #[test]
    fn load_yaml_clauses() {
        let path = std::env::temp_dir().join("osm-way-extract-filter-test.yaml");
        std::fs::write(&path, "- key: highway\n  value: construction\n- key: railway\n").unwrap();
        let clauses = TagFilter::load_yaml(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(
            clauses,
            vec![
                TagClause {
                    key: "highway".to_string(),
                    value: Some("construction".to_string()),
                },
                TagClause {
                    key: "railway".to_string(),
                    value: None,
                },
            ]
        );
        assert!(TagFilter::new(clauses)
            .unwrap()
            .matches(vec![("railway", "disused")]));
    }

    #[test]
    fn clauses_compose_with_or() {
        let f = filter(&["highway=construction", "railway"]);
        assert!(f.matches(vec![("highway", "construction")]));
        assert!(f.matches(vec![("railway", "disused")]));
        assert!(!f.matches(vec![("highway", "primary")]));
    }
}
