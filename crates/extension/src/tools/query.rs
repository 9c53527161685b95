//! `rlm_query` and `rlm_batch`: top-level recursive operations.
//!
//! The handler registers the operation on the call tree with an up-front
//! cost estimate, wires the operation-level timeout, drives the engine,
//! and renders the structured child result(s) for the host.

use std::time::Duration;

use serde::Deserialize;

use rlm_domain::child::{ChildResult, Confidence};
use rlm_domain::events::RlmEvent;
use rlm_domain::{Error, Result};
use rlm_engine::cost::CostEstimator;
use rlm_engine::engine::{BatchArgs, QueryArgs};

use crate::host::ToolOutput;
use crate::session::RlmSession;

#[derive(Deserialize)]
struct QueryParams {
    instructions: String,
    target: TargetParam,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TargetParam {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct BatchParams {
    instructions: String,
    targets: Vec<String>,
    #[serde(default)]
    model: Option<String>,
}

pub(crate) async fn execute_query(
    session: &RlmSession,
    params: serde_json::Value,
) -> Result<ToolOutput> {
    let params: QueryParams = serde_json::from_value(params)
        .map_err(|e| Error::Parse(format!("invalid rlm_query parameters: {e}")))?;
    let target_ids = match params.target {
        TargetParam::One(id) => vec![id],
        TargetParam::Many(ids) => ids,
    };
    if target_ids.is_empty() {
        return Err(Error::Parse("rlm_query needs at least one target".into()));
    }
    let _phase = session.enter_phase("query");

    let cfg = session.config().read().clone();
    let estimator = CostEstimator::new(cfg.pricing.clone());
    let estimate = estimator.estimate_query(
        &target_tokens(session, &target_ids),
        1,
        cfg.child_max_tokens,
        &estimate_model(session, &params.model, &cfg.child_model),
    );
    let (operation_id, cancel) = session.tree().register_operation(estimate.total());
    session.emit(RlmEvent::QueryStart {
        operation_id: operation_id.clone(),
        targets: target_ids.len(),
    });

    let args = QueryArgs {
        instructions: params.instructions,
        target_ids,
        parent_call_id: None,
        depth: 1,
        operation_id: operation_id.clone(),
        operation_cancel: cancel,
        host_model: session.host().model(),
        model_override: params.model,
    };
    // Spawned so an operation-level timeout aborts the work instead of
    // dropping it mid-flight; the children then resolve as cancelled.
    let engine = session.engine().clone();
    let task = tokio::spawn(async move { engine.query(args).await });
    let result = match tokio::time::timeout(
        Duration::from_secs(cfg.operation_timeout_sec),
        task,
    )
    .await
    {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => ChildResult::error(format!("operation failed: {join_err}")),
        Err(_) => {
            session.tree().abort_operation(&operation_id);
            ChildResult::error(format!(
                "operation timed out after {}s",
                cfg.operation_timeout_sec
            ))
        }
    };

    let op = session.tree().complete_operation(&operation_id);
    session.emit(RlmEvent::QueryEnd {
        operation_id,
        status: confidence_str(result.confidence).to_owned(),
    });

    let mut text = render_result(&result);
    if let Some(op) = op {
        text.push_str(&format!(
            "\n({} child call(s), est ${:.4}, actual ${:.4})",
            op.child_calls, op.estimated_cost, op.actual_cost
        ));
    }
    Ok(ToolOutput::ok(text).with_details(serde_json::to_value(&result)?))
}

pub(crate) async fn execute_batch(
    session: &RlmSession,
    params: serde_json::Value,
) -> Result<ToolOutput> {
    let params: BatchParams = serde_json::from_value(params)
        .map_err(|e| Error::Parse(format!("invalid rlm_batch parameters: {e}")))?;
    if params.targets.is_empty() {
        return Err(Error::Parse("rlm_batch needs at least one target".into()));
    }
    let _phase = session.enter_phase("batch");

    let cfg = session.config().read().clone();
    let estimator = CostEstimator::new(cfg.pricing.clone());
    let estimate = estimator.estimate_batch(
        &target_tokens(session, &params.targets),
        1,
        cfg.child_max_tokens,
        &estimate_model(session, &params.model, &cfg.child_model),
    );
    let (operation_id, cancel) = session.tree().register_operation(estimate.total());
    session.emit(RlmEvent::BatchStart {
        operation_id: operation_id.clone(),
        targets: params.targets.len(),
    });

    let targets = params.targets.clone();
    let args = BatchArgs {
        instructions: params.instructions,
        target_ids: params.targets,
        depth: 1,
        operation_id: operation_id.clone(),
        operation_cancel: cancel,
        host_model: session.host().model(),
        model_override: params.model,
    };
    let engine = session.engine().clone();
    let task = tokio::spawn(async move { engine.batch(args).await });
    let results = match tokio::time::timeout(
        Duration::from_secs(cfg.operation_timeout_sec),
        task,
    )
    .await
    {
        Ok(Ok(results)) => results,
        Ok(Err(join_err)) => vec![
            ChildResult::error(format!("operation failed: {join_err}"));
            targets.len()
        ],
        Err(_) => {
            session.tree().abort_operation(&operation_id);
            vec![
                ChildResult::error(format!(
                    "operation timed out after {}s",
                    cfg.operation_timeout_sec
                ));
                targets.len()
            ]
        }
    };

    let op = session.tree().complete_operation(&operation_id);
    session.emit(RlmEvent::BatchEnd {
        operation_id,
        completed: results.len(),
    });

    let mut text = format!("Batch over {} object(s):\n", targets.len());
    for (target, result) in targets.iter().zip(&results) {
        text.push_str(&format!(
            "\n### {target} ({})\n{}\n",
            confidence_str(result.confidence),
            result.answer
        ));
    }
    if let Some(op) = op {
        text.push_str(&format!(
            "\n({} child call(s), est ${:.4}, actual ${:.4})",
            op.child_calls, op.estimated_cost, op.actual_cost
        ));
    }
    Ok(ToolOutput::ok(text).with_details(serde_json::to_value(&results)?))
}

/// Token estimates for the targets, unknown ids counting as zero.
fn target_tokens(session: &RlmSession, ids: &[String]) -> Vec<u64> {
    ids.iter()
        .map(|id| {
            session
                .store()
                .get_index_entry(id)
                .map(|e| e.token_estimate)
                .unwrap_or(0)
        })
        .collect()
}

/// The model the cost estimate will be charged against.
fn estimate_model(
    session: &RlmSession,
    override_: &Option<String>,
    child_model: &Option<String>,
) -> String {
    override_
        .clone()
        .or_else(|| child_model.clone())
        .or_else(|| session.host().model())
        .unwrap_or_default()
}

fn confidence_str(confidence: Confidence) -> &'static str {
    match confidence {
        Confidence::High => "high",
        Confidence::Medium => "medium",
        Confidence::Low => "low",
    }
}

fn render_result(result: &ChildResult) -> String {
    let mut text = format!(
        "Answer ({} confidence):\n{}\n",
        confidence_str(result.confidence),
        result.answer
    );
    if !result.evidence.is_empty() {
        text.push_str("\nEvidence:\n");
        for item in &result.evidence {
            text.push_str(&format!("- {item}\n"));
        }
    }
    text
}
