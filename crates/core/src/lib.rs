#![forbid(unsafe_code)]

pub mod graph;
pub mod model;

pub mod ids {
    /// Project names are user-facing identifiers shared across replicas, so
    /// they are validated once at the boundary and passed around as-is.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ProjectName(String);

    impl ProjectName {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, ProjectNameError> {
            let value = value.into();
            validate_project_name(&value)?;
            Ok(Self(value))
        }

        pub fn into_string(self) -> String {
            self.0
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum ProjectNameError {
        Empty,
        TooLong,
        InvalidFirstChar,
        InvalidChar { ch: char, index: usize },
    }

    impl std::fmt::Display for ProjectNameError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Empty => write!(f, "project name must not be empty"),
                Self::TooLong => write!(f, "project name too long (max 128)"),
                Self::InvalidFirstChar => {
                    write!(f, "project name must start with an ASCII letter or digit")
                }
                Self::InvalidChar { ch, index } => {
                    write!(f, "project name has invalid char {ch:?} at index {index}")
                }
            }
        }
    }

    impl std::error::Error for ProjectNameError {}

    fn validate_project_name(value: &str) -> Result<(), ProjectNameError> {
        if value.is_empty() {
            return Err(ProjectNameError::Empty);
        }
        if value.len() > 128 {
            return Err(ProjectNameError::TooLong);
        }
        let mut chars = value.chars();
        let Some(first) = chars.next() else {
            return Err(ProjectNameError::Empty);
        };
        if !first.is_ascii_alphanumeric() {
            return Err(ProjectNameError::InvalidFirstChar);
        }
        for (index, ch) in value.chars().enumerate() {
            if index == 0 {
                continue;
            }
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '/' | '-') {
                continue;
            }
            return Err(ProjectNameError::InvalidChar { ch, index });
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::ProjectName;

        #[test]
        fn accepts_typical_names() {
            for name in ["default", "infra-2024", "team/alpha", "p0"] {
                assert!(ProjectName::try_new(name).is_ok(), "rejected {name}");
            }
        }

        #[test]
        fn rejects_empty_and_odd_names() {
            assert!(ProjectName::try_new("").is_err());
            assert!(ProjectName::try_new("-leading").is_err());
            assert!(ProjectName::try_new("has space").is_err());
        }
    }
}
