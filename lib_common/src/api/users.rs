use std::collections::HashSet;

/// Decides which user a request's readings belong to. There is no
/// authentication; the header is a hint.
pub trait UserDirectory: Send + Sync {
    /// The user for a request carrying `requested` in `X-Sensor-User`.
    fn resolve(&self, requested: Option<&str>) -> String;
}

/// A fixed list of users plus a default for everything else.
#[derive(Debug, Clone)]
pub struct StaticUserDirectory {
    default_user: String,
    known: HashSet<String>,
}

impl StaticUserDirectory {
    pub fn new<I, S>(default_user: impl Into<String>, known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            default_user: default_user.into(),
            known: known.into_iter().map(Into::into).collect(),
        }
    }
}

impl UserDirectory for StaticUserDirectory {
    fn resolve(&self, requested: Option<&str>) -> String {
        match requested.map(str::trim) {
            Some(user) if self.known.contains(user) => user.to_string(),
            _ => self.default_user.clone(),
        }
    }
}
