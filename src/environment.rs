use std::collections::HashMap;

/// A type-safe wrapper for the environment variables passed to a supervised
/// process.
///
/// Processes are always launched with an explicit environment map rather
/// than silently inheriting the engine's own environment, so the variables a
/// test runs with are exactly the variables it declared. Use
/// [`Environment::inherited`] as a starting point when a test genuinely
/// wants the host environment.
#[derive(Debug, Clone, Default)]
pub struct Environment(HashMap<String, String>);

impl Environment {
    /// Creates a new empty environment variable set.
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Creates an environment pre-populated with the host process's
    /// variables, for tests whose processes need the ambient PATH and
    /// friends.
    pub fn inherited() -> Self {
        Self(std::env::vars().collect())
    }

    /// Sets an environment variable in this environment set.
    ///
    /// # Examples
    /// ```
    /// use testrig::Environment;
    ///
    /// let mut env = Environment::new();
    /// env.set("SERVER_PORT", "18042");
    /// env.set("LOG_LEVEL", "debug");
    /// ```
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Extends this environment with variables from another environment.
    ///
    /// Variables in `other` overwrite variables with the same name here;
    /// this is how per-run overrides are layered over a process spec's
    /// declared environment.
    pub fn extend(&mut self, other: &Environment) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Gets the value of an environment variable.
    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    /// Iterates over the variables as `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Returns true if the environment contains no variables.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of environment variables.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<HashMap<String, String>> for Environment {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
