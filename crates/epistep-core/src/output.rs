//! Step-indexed count matrix: one row per step, one column per state.
//!
//! The matrix is filled by a process registered alongside the model's other
//! processes, so each row holds the counts observed before that step's flush.

use std::cell::RefCell;
use std::rc::Rc;

use crate::fixed::Time;
use crate::sim::{Process, process};

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CountMatrix {
    labels: Vec<String>,
    times: Vec<Time>,
    rows: Vec<Vec<usize>>,
}

impl CountMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a matrix for sharing with a recorder process.
    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new()))
    }

    /// A process that appends the current persons-per-state counts to
    /// `matrix` once per step.
    pub fn recorder(matrix: &Rc<RefCell<Self>>) -> Process {
        let matrix = Rc::clone(matrix);
        process(move |ctx, time| {
            let population = ctx.population();
            let mut m = matrix.borrow_mut();
            if m.labels.is_empty() {
                m.labels = population.state_labels().to_vec();
            }
            m.record(time, population.state_counts());
            Ok(())
        })
    }

    /// Append a row.
    pub fn record(&mut self, time: Time, counts: Vec<usize>) {
        self.times.push(time);
        self.rows.push(counts);
    }

    /// Column labels in state-index order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.rows
    }

    /// Step of each row.
    pub fn times(&self) -> &[Time] {
        &self.times
    }

    /// Counts recorded at `time`.
    pub fn row(&self, time: Time) -> Option<&[usize]> {
        let i = self.times.iter().position(|t| *t == time)?;
        Some(&self.rows[i])
    }

    /// Every row's count for the state named `label`.
    pub fn column(&self, label: &str) -> Option<Vec<usize>> {
        let c = self.labels.iter().position(|l| l == label)?;
        Some(self.rows.iter().map(|r| r[c]).collect())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
