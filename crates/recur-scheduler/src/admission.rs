/// Outcome of admission control for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The run may start. `cancelled` lists runs superseded under
    /// `cancel-previous`; the caller should signal them if they are in flight.
    Admitted { cancelled: Vec<String> },
    /// The run must not execute and is recorded as FAILED with `reason`.
    Rejected { reason: String },
    /// `queue` policy: the run goes back to DUE and waits its turn.
    Deferred { reason: String },
}

impl Admission {
    pub fn admitted() -> Self {
        Admission::Admitted {
            cancelled: Vec::new(),
        }
    }

    pub fn can_run(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Admission::Admitted { .. } => None,
            Admission::Rejected { reason } | Admission::Deferred { reason } => Some(reason),
        }
    }
}
