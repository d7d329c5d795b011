use fail::FailScenario;

/// Configures failpoints for the duration of a test.
///
/// Holding the scenario serializes failpoint tests within the process. Every configured
/// failpoint is switched off again when the scenario is dropped.
pub struct ScopedFailpoints<'a> {
    _scenario: FailScenario<'a>,
    failpoints: Vec<String>,
}

impl<'a> ScopedFailpoints<'a> {
    /// Enables each `(failpoint, action)` pair, using the action syntax of [`fail::cfg`].
    pub fn setup(failpoints: &[(&str, &str)]) -> ScopedFailpoints<'a> {
        let mut scoped = Self {
            _scenario: FailScenario::setup(),
            failpoints: Vec::new(),
        };

        for (failpoint, action) in failpoints {
            scoped.configure(failpoint, action);
        }

        scoped
    }

    /// Enables `failpoint` with `action` until the scenario is dropped or the failpoint removed.
    pub fn configure(&mut self, failpoint: &str, action: &str) {
        fail::cfg(failpoint, action).unwrap();
        self.failpoints.push(failpoint.to_string());
    }

    /// Switches `failpoint` off again.
    pub fn remove(&mut self, failpoint: &str) {
        fail::remove(failpoint);
        self.failpoints.retain(|configured| configured != failpoint);
    }
}

impl Drop for ScopedFailpoints<'_> {
    fn drop(&mut self) {
        for failpoint in &self.failpoints {
            fail::remove(failpoint);
        }
    }
}
