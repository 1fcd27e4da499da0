//! Plan seeding from planner output

use crate::array::ExecutionArray;
use std::collections::HashSet;
use tracing::info;
use types::{
    utils, AgentResult, ExecutionId, ExecutionItem, ExecutionType, ItemPayload, PlanError, Result,
    SessionId,
};
use uuid::Uuid;

/// Convert ordered agent results into pending items
pub fn items_from_agent_results(results: Vec<AgentResult>) -> std::result::Result<Vec<ExecutionItem>, PlanError> {
    if results.is_empty() {
        return Err(PlanError::Empty);
    }

    let mut seen = HashSet::new();
    let mut items = Vec::with_capacity(results.len());

    for (index, result) in results.into_iter().enumerate() {
        let id = result.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        if !seen.insert(id.clone()) {
            return Err(PlanError::DuplicateId { id });
        }

        let payload = payload_for(index, &result)?;
        let mut item = ExecutionItem::new(id, index, result.description, payload);
        item.estimated_fee = result.estimated_fee;
        item.warnings = utils::dedup_warnings(&result.warnings);
        item.metadata = result.metadata;
        items.push(item);
    }

    Ok(items)
}

/// Build a new execution array seeded with the planner's results
pub fn seed_from_agent_results(
    execution_id: ExecutionId,
    session_id: SessionId,
    results: Vec<AgentResult>,
) -> Result<ExecutionArray> {
    let items = items_from_agent_results(results)?;
    let count = items.len();

    let array = ExecutionArray::new(execution_id, session_id.clone());
    array.seed(items)?;

    info!(
        execution_id = %execution_id,
        session_id = %session_id,
        items = count,
        "Seeded execution plan"
    );
    Ok(array)
}

fn payload_for(index: usize, result: &AgentResult) -> std::result::Result<ItemPayload, PlanError> {
    let missing_data = || PlanError::MissingData {
        index,
        execution_type: result.execution_type.as_str().to_string(),
    };

    let payload = match result.execution_type {
        ExecutionType::Extrinsic => ItemPayload::Extrinsic {
            call: result.call.clone().ok_or(PlanError::MissingCall { index })?,
            signer: result.signer.clone().ok_or(PlanError::MissingSigner { index })?,
        },
        ExecutionType::DataFetch => ItemPayload::DataFetch {
            data: result.data.clone().ok_or_else(missing_data)?,
        },
        ExecutionType::Validation => {
            let data = result.data.clone().ok_or_else(missing_data)?;
            // planners report the outcome as `passed` or `valid`
            let passed = ["passed", "valid"]
                .iter()
                .find_map(|key| data.get(*key).and_then(|v| v.as_bool()))
                .unwrap_or(true);
            ItemPayload::Validation { passed, data }
        }
        ExecutionType::UserInput => ItemPayload::UserInput {
            prompt: result.description.clone(),
            value: result.data.clone(),
        },
    };
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{ChainCall, ExecutionStatus};

    fn result(execution_type: ExecutionType) -> AgentResult {
        AgentResult {
            id: None,
            description: "step".to_string(),
            execution_type,
            call: None,
            signer: None,
            data: None,
            estimated_fee: 0,
            warnings: Vec::new(),
            metadata: Default::default(),
        }
    }

    fn transfer() -> AgentResult {
        AgentResult {
            call: Some(ChainCall::Transfer {
                dest: "bob".into(),
                amount: 10,
            }),
            signer: Some("alice".into()),
            warnings: vec!["low balance".to_string(), "low balance".to_string()],
            ..result(ExecutionType::Extrinsic)
        }
    }

    #[test]
    fn test_seeds_items_in_order() {
        let results = vec![
            AgentResult {
                data: Some(serde_json::json!({ "free": "100" })),
                ..result(ExecutionType::DataFetch)
            },
            transfer(),
            AgentResult {
                data: Some(serde_json::json!({ "valid": false, "reason": "too small" })),
                ..result(ExecutionType::Validation)
            },
            result(ExecutionType::UserInput),
        ];

        let items = items_from_agent_results(results).unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[1].index, 1);
        assert!(items[1].is_extrinsic());
        assert_eq!(items[1].warnings, vec!["low balance".to_string()]);
        assert!(matches!(items[2].payload, ItemPayload::Validation { passed: false, .. }));
        assert!(matches!(items[3].payload, ItemPayload::UserInput { value: None, .. }));
    }

    #[test]
    fn test_rejects_malformed_results() {
        assert_eq!(items_from_agent_results(Vec::new()).unwrap_err(), PlanError::Empty);

        let err = items_from_agent_results(vec![transfer(), result(ExecutionType::Extrinsic)]).unwrap_err();
        assert_eq!(err, PlanError::MissingCall { index: 1 });

        let unsigned = AgentResult {
            signer: None,
            ..transfer()
        };
        assert_eq!(
            items_from_agent_results(vec![unsigned]).unwrap_err(),
            PlanError::MissingSigner { index: 0 }
        );

        let err = items_from_agent_results(vec![result(ExecutionType::DataFetch)]).unwrap_err();
        assert!(matches!(err, PlanError::MissingData { index: 0, .. }));

        let dup = AgentResult {
            id: Some("x".to_string()),
            ..transfer()
        };
        let err = items_from_agent_results(vec![dup.clone(), dup]).unwrap_err();
        assert_eq!(err, PlanError::DuplicateId { id: "x".to_string() });
    }

    #[test]
    fn test_seed_builds_pending_array() {
        let array =
            seed_from_agent_results(Uuid::new_v4(), "session-1".to_string(), vec![transfer(), transfer()])
                .unwrap();
        let state = array.snapshot();
        assert_eq!(state.session_id, "session-1");
        assert_eq!(state.total_items, 2);
        assert!(state.items.iter().all(|i| i.status == ExecutionStatus::Pending));
    }
}
