use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display, Write},
};

/// Outcome of [`Network::test`](crate::Network::test).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestResult {
    pub num_success: usize,
    pub num_total: usize,
    /// predicted -> actual -> count
    pub confusion_matrix: BTreeMap<usize, BTreeMap<usize, usize>>,
}

impl TestResult {
    pub(crate) fn record(&mut self, predicted: usize, actual: usize) {
        if predicted == actual {
            self.num_success += 1;
        }
        self.num_total += 1;
        *self
            .confusion_matrix
            .entry(predicted)
            .or_default()
            .entry(actual)
            .or_default() += 1;
    }
    /// Percent of correct predictions, 0 when empty.
    pub fn accuracy(&self) -> f64 {
        if self.num_total == 0 {
            0.
        } else {
            self.num_success as f64 * 100. / self.num_total as f64
        }
    }
    /// Every label either predicted or expected.
    pub fn labels(&self) -> BTreeSet<usize> {
        let mut labels = BTreeSet::new();
        for (predicted, row) in self.confusion_matrix.iter() {
            labels.insert(*predicted);
            labels.extend(row.keys().copied());
        }
        labels
    }
    /// The summary followed by the confusion matrix, predictions as rows.
    pub fn detail(&self) -> String {
        let labels = self.labels();
        let mut out = format!("{self}\n");
        let _ = write!(out, "{:>5} ", "*");
        for c in labels.iter() {
            let _ = write!(out, "{c:>5} ");
        }
        out.push('\n');
        for r in labels.iter() {
            let _ = write!(out, "{r:>5} ");
            for c in labels.iter() {
                let count = self
                    .confusion_matrix
                    .get(r)
                    .and_then(|row| row.get(c))
                    .copied()
                    .unwrap_or(0);
                let _ = write!(out, "{count:>5} ");
            }
            out.push('\n');
        }
        out
    }
}

impl Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "accuracy:{}% ({}/{})",
            self.accuracy(),
            self.num_success,
            self.num_total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_and_detail() {
        let mut result = TestResult::default();
        result.record(0, 0);
        result.record(1, 1);
        result.record(1, 0);
        result.record(2, 2);
        assert_eq!(result.num_success, 3);
        assert_eq!(result.accuracy(), 75.);
        assert_eq!(result.to_string(), "accuracy:75% (3/4)");
        assert_eq!(result.labels().into_iter().collect::<Vec<_>>(), [0, 1, 2]);
        let detail = result.detail();
        let lines: Vec<&str> = detail.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[1], "    *     0     1     2 ");
        assert_eq!(lines[3], "    1     1     1     0 ");
    }

    #[test]
    fn empty() {
        let result = TestResult::default();
        assert_eq!(result.accuracy(), 0.);
        assert!(result.labels().is_empty());
    }
}
