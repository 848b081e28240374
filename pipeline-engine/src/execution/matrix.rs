// Matrix Expansion
// Fans a task out into one instance per parameter combination

use crate::model::{MatrixInclude, Param, ParamValue};

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatrixError {
    #[error("matrix parameter '{0}' must be an array")]
    NotAnArray(String),

    #[error("matrix include parameter '{0}' must be a string")]
    IncludeNotAString(String),

    #[error("matrix expands to {count} combinations, more than the limit of {max}")]
    TooManyCombinations { count: usize, max: usize },
}

/// A single matrix instance (one combination of parameter values)
#[derive(Debug, Clone, PartialEq)]
pub struct Combination {
    /// Position in the fan-out, used for the instance name
    pub index: usize,
    /// Name of the include entry that produced or extended it
    pub name: Option<String>,
    pub params: Vec<Param>,
}

impl Combination {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// `<task>-<index>`
    pub fn instance_name(&self, task: &str) -> String {
        format!("{}-{}", task, self.index)
    }
}

pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand already-substituted matrix parameters and includes.
    ///
    /// The first parameter varies slowest. An include whose parameters
    /// agree with a combination on every matrix parameter it names
    /// extends that combination without overwriting it; an include that
    /// matches nothing becomes a combination of its own.
    pub fn expand(
        params: &[Param],
        include: &[MatrixInclude],
        max: usize,
    ) -> Result<Vec<Combination>, MatrixError> {
        let mut axes = Vec::with_capacity(params.len());
        for param in params {
            match &param.value {
                ParamValue::Array(values) => axes.push((param.name.as_str(), values)),
                _ => return Err(MatrixError::NotAnArray(param.name.clone())),
            }
        }

        // Check the size before building anything
        let count = axes
            .iter()
            .try_fold(1usize, |acc, (_, values)| acc.checked_mul(values.len()))
            .unwrap_or(usize::MAX);
        if !axes.is_empty() && count > max {
            return Err(MatrixError::TooManyCombinations { count, max });
        }

        let mut combos: Vec<(Option<String>, Vec<(String, String)>)> = if axes.is_empty() {
            Vec::new()
        } else {
            vec![(None, Vec::new())]
        };
        for (name, values) in &axes {
            combos = combos
                .into_iter()
                .flat_map(|(label, combo)| {
                    values.iter().map(move |v| {
                        let mut next = combo.clone();
                        next.push((name.to_string(), v.clone()));
                        (label.clone(), next)
                    })
                })
                .collect();
        }

        let matrix_names: Vec<&str> = axes.iter().map(|(n, _)| *n).collect();
        for entry in include {
            let mut pairs = Vec::with_capacity(entry.params.len());
            for param in &entry.params {
                match &param.value {
                    ParamValue::String(s) => pairs.push((param.name.clone(), s.clone())),
                    _ => return Err(MatrixError::IncludeNotAString(param.name.clone())),
                }
            }

            let mut matched = false;
            for (label, combo) in combos.iter_mut() {
                let agrees = pairs
                    .iter()
                    .filter(|(n, _)| matrix_names.contains(&n.as_str()))
                    .all(|(n, v)| combo.iter().any(|(cn, cv)| cn == n && cv == v));
                if !agrees || axes.is_empty() {
                    continue;
                }
                matched = true;
                for (n, v) in &pairs {
                    if !combo.iter().any(|(cn, _)| cn == n) {
                        combo.push((n.clone(), v.clone()));
                    }
                }
                if entry.name.is_some() {
                    *label = entry.name.clone();
                }
            }
            if !matched {
                combos.push((entry.name.clone(), pairs));
            }
        }

        if combos.len() > max {
            return Err(MatrixError::TooManyCombinations {
                count: combos.len(),
                max,
            });
        }

        Ok(combos
            .into_iter()
            .enumerate()
            .map(|(index, (name, pairs))| Combination {
                index,
                name,
                params: pairs
                    .into_iter()
                    .map(|(n, v)| Param::new(n, v))
                    .collect(),
            })
            .collect())
    }

    /// Merge instance results into the node's results.
    ///
    /// A string result becomes an array in instance order, but only when
    /// every instance wrote it.
    pub fn aggregate_results(
        instances: &[HashMap<String, ParamValue>],
    ) -> HashMap<String, ParamValue> {
        let mut aggregated = HashMap::new();
        let Some(first) = instances.first() else {
            return aggregated;
        };

        for name in first.keys() {
            let values: Option<Vec<String>> = instances
                .iter()
                .map(|results| results.get(name).and_then(|v| v.as_str()).map(str::to_string))
                .collect();
            if let Some(values) = values {
                aggregated.insert(name.clone(), ParamValue::Array(values));
            }
        }
        aggregated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(name: &str, values: &[&str]) -> Param {
        Param::new(name, ParamValue::from(values.to_vec()))
    }

    fn include(name: Option<&str>, params: &[(&str, &str)]) -> MatrixInclude {
        MatrixInclude {
            name: name.map(str::to_string),
            params: params.iter().map(|(n, v)| Param::new(*n, *v)).collect(),
        }
    }

    fn values(combo: &Combination) -> Vec<(String, String)> {
        combo
            .params
            .iter()
            .map(|p| (p.name.clone(), p.value.render()))
            .collect()
    }

    #[test]
    fn test_cartesian_product() {
        let combos = MatrixExpander::expand(
            &[axis("os", &["linux", "mac"]), axis("arch", &["amd64", "arm64"])],
            &[],
            256,
        )
        .unwrap();

        assert_eq!(combos.len(), 4);
        assert_eq!(combos[0].get("os"), Some(&ParamValue::from("linux")));
        assert_eq!(combos[0].get("arch"), Some(&ParamValue::from("amd64")));
        assert_eq!(combos[1].get("arch"), Some(&ParamValue::from("arm64")));
        assert_eq!(combos[3].get("os"), Some(&ParamValue::from("mac")));
        assert_eq!(combos[3].instance_name("build"), "build-3");
    }

    #[test]
    fn test_include_extends_matching_combinations() {
        let combos = MatrixExpander::expand(
            &[axis("os", &["linux", "mac"])],
            &[include(Some("linux-flags"), &[("os", "linux"), ("flags", "-static")])],
            256,
        )
        .unwrap();

        assert_eq!(combos.len(), 2);
        assert_eq!(
            values(&combos[0]),
            vec![
                ("os".to_string(), "linux".to_string()),
                ("flags".to_string(), "-static".to_string())
            ]
        );
        assert_eq!(combos[0].name.as_deref(), Some("linux-flags"));
        assert_eq!(combos[1].get("flags"), None);
    }

    #[test]
    fn test_include_without_matrix_names_applies_to_all() {
        let combos = MatrixExpander::expand(
            &[axis("os", &["linux", "mac"])],
            &[include(None, &[("version", "1.2")])],
            256,
        )
        .unwrap();
        assert!(combos.iter().all(|c| c.get("version") == Some(&ParamValue::from("1.2"))));
    }

    #[test]
    fn test_include_never_overwrites() {
        let combos = MatrixExpander::expand(
            &[axis("os", &["linux"])],
            &[
                include(None, &[("flags", "-O2")]),
                include(None, &[("flags", "-O0")]),
            ],
            256,
        )
        .unwrap();
        assert_eq!(combos.len(), 1);
        assert_eq!(combos[0].get("flags"), Some(&ParamValue::from("-O2")));
    }

    #[test]
    fn test_unmatched_include_adds_combination() {
        let combos = MatrixExpander::expand(
            &[axis("os", &["linux"])],
            &[include(Some("win"), &[("os", "windows"), ("shell", "pwsh")])],
            256,
        )
        .unwrap();
        assert_eq!(combos.len(), 2);
        assert_eq!(combos[1].name.as_deref(), Some("win"));
        assert_eq!(combos[1].get("shell"), Some(&ParamValue::from("pwsh")));
    }

    #[test]
    fn test_include_only() {
        let combos = MatrixExpander::expand(
            &[],
            &[
                include(Some("a"), &[("target", "a")]),
                include(Some("b"), &[("target", "b")]),
            ],
            256,
        )
        .unwrap();
        assert_eq!(combos.len(), 2);
        assert_eq!(combos[1].index, 1);
    }

    #[test]
    fn test_empty_axis_gives_no_combinations() {
        let combos = MatrixExpander::expand(&[axis("os", &[])], &[], 256).unwrap();
        assert!(combos.is_empty());
    }

    #[test]
    fn test_limits_and_types() {
        let err = MatrixExpander::expand(
            &[axis("a", &["1", "2", "3"]), axis("b", &["1", "2", "3"])],
            &[],
            8,
        )
        .unwrap_err();
        assert_eq!(err, MatrixError::TooManyCombinations { count: 9, max: 8 });

        let err = MatrixExpander::expand(&[Param::new("a", "x")], &[], 8).unwrap_err();
        assert_eq!(err, MatrixError::NotAnArray("a".to_string()));
    }

    #[test]
    fn test_aggregate_results() {
        let mut first = HashMap::new();
        first.insert("digest".to_string(), ParamValue::from("a"));
        first.insert("only-first".to_string(), ParamValue::from("x"));
        let mut second = HashMap::new();
        second.insert("digest".to_string(), ParamValue::from("b"));

        let aggregated = MatrixExpander::aggregate_results(&[first, second]);
        assert_eq!(
            aggregated.get("digest"),
            Some(&ParamValue::from(vec!["a", "b"]))
        );
        assert!(!aggregated.contains_key("only-first"));
    }
}
