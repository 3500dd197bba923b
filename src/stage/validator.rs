//! Schema Validator：阶段原始输出 -> 归一化结构，或 SchemaError
//!
//! 纯函数，无副作用。阶段隔离在这里强制执行：感知输出一旦包含动作建议即拒绝。

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::core::SchemaError;
use crate::stage::contract::{
    AnswerShape, CoachDecision, CoachOutput, CoachWire, Contract, NextStepWire, PerceptionOutput,
    PerceptionWire, QuestionPlan, QuestionWire, StepPlan, Verdict, VerifierOutput, VerifierWire,
};

/// 感知输出中不允许出现的键（动作建议属于 Planner）
const FORBIDDEN_PERCEPTION_KEYS: &[&str] = &[
    "next_step",
    "action",
    "actions",
    "proposed_action",
    "proposed_actions",
    "instruction",
    "suggested_action",
    "suggested_actions",
    "recommendation",
    "recommendations",
];

/// 按契约名校验后的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedOutput {
    Perception(PerceptionOutput),
    Coach(CoachOutput),
    Verifier(VerifierOutput),
}

/// 按契约名校验原始输出
pub fn validate(contract: Contract, raw: &str) -> Result<ValidatedOutput, SchemaError> {
    match contract {
        Contract::Perception => validate_perception(raw).map(ValidatedOutput::Perception),
        Contract::Coach => validate_coach(raw).map(ValidatedOutput::Coach),
        Contract::Verifier => validate_verifier(raw).map(ValidatedOutput::Verifier),
    }
}

/// 提取 JSON 片段（```json ... ``` 或首个 `{` 到最后一个 `}`）
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return rest
            .find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim());
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

fn parse_object(contract: Contract, raw: &str) -> Result<Map<String, Value>, SchemaError> {
    match serde_json::from_str::<Value>(extract_json(raw)) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(SchemaError::new(contract, "output is not a JSON object", raw)),
        Err(e) => Err(SchemaError::new(contract, format!("invalid JSON: {e}"), raw)),
    }
}

fn decode<T: DeserializeOwned>(
    contract: Contract,
    map: Map<String, Value>,
    raw: &str,
) -> Result<T, SchemaError> {
    serde_json::from_value(Value::Object(map))
        .map_err(|e| SchemaError::new(contract, format!("structure mismatch: {e}"), raw))
}

/// 空白字符串视为缺失
fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn clean_list(list: Option<Vec<String>>) -> Vec<String> {
    list.unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn validate_perception(raw: &str) -> Result<PerceptionOutput, SchemaError> {
    let contract = Contract::Perception;
    let map = parse_object(contract, raw)?;

    if let Some(key) = FORBIDDEN_PERCEPTION_KEYS
        .iter()
        .find(|k| map.contains_key(**k))
    {
        return Err(SchemaError::new(
            contract,
            format!("perception must not propose actions (found `{key}`)"),
            raw,
        ));
    }

    let wire: PerceptionWire = decode(contract, map, raw)?;
    let scene_summary = wire.scene_summary.trim().to_string();
    if scene_summary.is_empty() {
        return Err(SchemaError::new(contract, "scene_summary is empty", raw));
    }

    Ok(PerceptionOutput {
        scene_summary,
        state_estimate: wire.state_estimate,
        state_delta: wire.state_delta,
        uncertainties: clean_list(wire.uncertainties),
        salient_objects: clean_list(wire.salient_objects),
        readable_text: non_empty(wire.readable_text),
    })
}

fn normalize_step(wire: NextStepWire, raw: &str) -> Result<StepPlan, SchemaError> {
    let contract = Contract::Coach;
    let instruction = non_empty(wire.instruction)
        .ok_or_else(|| SchemaError::new(contract, "next_step.instruction is missing", raw))?;
    let success_criteria: Vec<_> = wire
        .success_criteria
        .into_iter()
        .filter(|c| !c.subject.trim().is_empty() && !c.expected.trim().is_empty())
        .collect();
    if success_criteria.is_empty() {
        return Err(SchemaError::new(
            contract,
            "next_step.success_criteria must list at least one {subject, expected} check",
            raw,
        ));
    }
    let title = non_empty(wire.title).unwrap_or_else(|| instruction.clone());
    Ok(StepPlan {
        title,
        instruction,
        success_criteria,
        verification_request: non_empty(wire.verification_request),
        completes_task: wire.completes_task.unwrap_or(false),
    })
}

fn normalize_question(wire: QuestionWire, raw: &str) -> Result<QuestionPlan, SchemaError> {
    let contract = Contract::Coach;
    let text = non_empty(wire.text)
        .ok_or_else(|| SchemaError::new(contract, "question.text is missing", raw))?;
    let shape = match non_empty(wire.answer_shape).as_deref() {
        None | Some("free_text") => AnswerShape::FreeText,
        Some("yes_no") => AnswerShape::YesNo,
        Some("choice") => {
            let options = clean_list(Some(wire.options));
            if options.len() < 2 {
                return Err(SchemaError::new(
                    contract,
                    "choice question needs at least two options",
                    raw,
                ));
            }
            AnswerShape::Choice { options }
        }
        Some(other) => {
            return Err(SchemaError::new(
                contract,
                format!("unknown answer_shape `{other}`"),
                raw,
            ))
        }
    };
    Ok(QuestionPlan { text, shape })
}

pub fn validate_coach(raw: &str) -> Result<CoachOutput, SchemaError> {
    let contract = Contract::Coach;
    let map = parse_object(contract, raw)?;
    let wire: CoachWire = decode(contract, map, raw)?;

    let safety_warnings = clean_list(wire.safety_warnings);
    let task_complete = wire.task_complete.unwrap_or(false);

    let decision = match (wire.next_step, wire.question, task_complete) {
        (Some(_), Some(_), _) => {
            return Err(SchemaError::new(
                contract,
                "next_step and question must not both be present",
                raw,
            ))
        }
        (Some(_), None, true) | (None, Some(_), true) => {
            return Err(SchemaError::new(
                contract,
                "task_complete must not be combined with next_step or question",
                raw,
            ))
        }
        (Some(step), None, false) => CoachDecision::NextStep(normalize_step(step, raw)?),
        (None, Some(question), false) => CoachDecision::Question(normalize_question(question, raw)?),
        (None, None, true) => CoachDecision::TaskComplete,
        (None, None, false) if !safety_warnings.is_empty() => CoachDecision::SafetyOnly,
        (None, None, false) => {
            return Err(SchemaError::new(
                contract,
                "output must contain next_step, question, task_complete or safety_warnings",
                raw,
            ))
        }
    };

    Ok(CoachOutput {
        decision,
        safety_warnings,
        message: non_empty(wire.message),
    })
}

pub fn validate_verifier(raw: &str) -> Result<VerifierOutput, SchemaError> {
    let contract = Contract::Verifier;
    let map = parse_object(contract, raw)?;
    let wire: VerifierWire = decode(contract, map, raw)?;

    let verdict = match wire.verdict.trim().to_lowercase().as_str() {
        "pass" => Verdict::Pass,
        "fail" => Verdict::Fail,
        "unclear" => Verdict::Unclear,
        other => {
            return Err(SchemaError::new(
                contract,
                format!("verdict `{other}` is not one of pass/fail/unclear"),
                raw,
            ))
        }
    };
    let reason = non_empty(wire.reason)
        .ok_or_else(|| SchemaError::new(contract, "reason is missing", raw))?;

    let correction = match (verdict, wire.correction) {
        (Verdict::Fail, Some(Value::String(text))) => {
            let text = text.trim().to_string();
            if text.is_empty() {
                return Err(SchemaError::new(contract, "fail requires a correction", raw));
            }
            Some(text)
        }
        (Verdict::Fail, Some(Value::Array(_))) => {
            return Err(SchemaError::new(
                contract,
                "fail requires exactly one correction, not a list",
                raw,
            ))
        }
        (Verdict::Fail, _) => {
            return Err(SchemaError::new(contract, "fail requires a correction", raw))
        }
        _ => None,
    };

    let evidence_request = match verdict {
        Verdict::Unclear => Some(non_empty(wire.request_new_evidence).ok_or_else(|| {
            SchemaError::new(
                contract,
                "unclear requires request_new_evidence (angle or lighting)",
                raw,
            )
        })?),
        _ => None,
    };

    Ok(VerifierOutput {
        verdict,
        reason,
        correction,
        evidence_request,
    })
}
