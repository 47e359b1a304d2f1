//! Aggregate statement classification and pass rate.

use serde::{Deserialize, Serialize};
use sqlgate_driver::protocol::{RuleLevel, StatementKind};

use super::task::{string_enum, ExecuteSql};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Aggregate statement type of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    Dml,
    Ddl,
    ProcedureFunction,
    /// DML and DDL mixed.
    Multi,
    /// Procedure or function definitions mixed with other statements.
    ProcedureFunctionMulti,
}

string_enum!(SqlType {
    Dml => "dml",
    Ddl => "ddl",
    ProcedureFunction => "procedure_function",
    Multi => "multi",
    ProcedureFunctionMulti => "procedure_function_multi",
});

impl SqlType {
    /// Classify a batch from its statement tags. `None` for an empty batch.
    pub fn classify<I>(kinds: I) -> Option<SqlType>
    where
        I: IntoIterator<Item = StatementKind>,
    {
        let (mut dml, mut ddl, mut routine) = (false, false, false);
        for kind in kinds {
            match kind {
                StatementKind::Dml => dml = true,
                StatementKind::Ddl => ddl = true,
                StatementKind::Procedure | StatementKind::Function => routine = true,
            }
        }

        match (dml, ddl, routine) {
            (false, false, false) => None,
            (_, _, true) if dml || ddl => Some(SqlType::ProcedureFunctionMulti),
            (_, _, true) => Some(SqlType::ProcedureFunction),
            (true, true, false) => Some(SqlType::Multi),
            (true, false, false) => Some(SqlType::Dml),
            (false, true, false) => Some(SqlType::Ddl),
        }
    }

    /// Classify from the parsed nodes held by each statement.
    pub fn classify_sqls(sqls: &[ExecuteSql]) -> Option<SqlType> {
        SqlType::classify(sqls.iter().flat_map(|s| s.nodes.iter().map(|n| n.kind)))
    }

    /// Reject the mixed types that can not be executed.
    pub fn executable(self) -> OrchestratorResult<SqlType> {
        match self {
            SqlType::Multi => Err(OrchestratorError::SqlTypeConflict),
            SqlType::ProcedureFunctionMulti => Err(OrchestratorError::ProcedureFunctionConflict),
            other => Ok(other),
        }
    }
}

/// Round half up, truncated to `digits` decimals.
pub fn round(value: f64, digits: i32) -> f64 {
    let p = 10f64.powi(digits);
    (value * p + 0.5).trunc() / p
}

/// Fraction of statements audited at the `normal` level, 4 decimals.
/// `None` for a task without statements.
pub fn pass_rate(sqls: &[ExecuteSql]) -> Option<f64> {
    if sqls.is_empty() {
        return None;
    }
    let normal = sqls
        .iter()
        .filter(|s| s.audit_level == Some(RuleLevel::Normal))
        .count();
    Some(round(normal as f64 / sqls.len() as f64, 4))
}

#[cfg(test)]
mod tests {
    use super::*;
    use StatementKind::*;

    #[test]
    fn test_classify_single_kinds() {
        assert_eq!(SqlType::classify([Dml, Dml]), Some(SqlType::Dml));
        assert_eq!(SqlType::classify([Ddl]), Some(SqlType::Ddl));
        assert_eq!(
            SqlType::classify([Procedure, Function]),
            Some(SqlType::ProcedureFunction)
        );
        assert_eq!(SqlType::classify(Vec::<StatementKind>::new()), None);
    }

    #[test]
    fn test_classify_conflicts() {
        assert_eq!(SqlType::classify([Ddl, Dml]), Some(SqlType::Multi));
        assert_eq!(
            SqlType::classify([Procedure, Ddl]),
            Some(SqlType::ProcedureFunctionMulti)
        );
        assert!(matches!(
            SqlType::Multi.executable(),
            Err(OrchestratorError::SqlTypeConflict)
        ));
        assert!(matches!(
            SqlType::ProcedureFunctionMulti.executable(),
            Err(OrchestratorError::ProcedureFunctionConflict)
        ));
        assert_eq!(SqlType::Ddl.executable().unwrap(), SqlType::Ddl);
    }

    #[test]
    fn test_round_half_up() {
        assert_eq!(round(2.0 / 3.0, 4), 0.6667);
        assert_eq!(round(1.0 / 3.0, 4), 0.3333);
        assert_eq!(round(1.0, 4), 1.0);
    }

    #[test]
    fn test_pass_rate() {
        let mut sqls = vec![
            ExecuteSql::new(1, 1, "a"),
            ExecuteSql::new(1, 2, "b"),
            ExecuteSql::new(1, 3, "c"),
        ];
        sqls[0].audit_level = Some(RuleLevel::Normal);
        sqls[1].audit_level = Some(RuleLevel::Warn);
        sqls[2].audit_level = Some(RuleLevel::Normal);

        let first = pass_rate(&sqls);
        assert_eq!(first, Some(0.6667));
        assert_eq!(pass_rate(&sqls), first);
        assert_eq!(pass_rate(&[]), None);
    }
}
