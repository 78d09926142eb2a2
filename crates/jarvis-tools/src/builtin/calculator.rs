// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolOutput};

/// Arithmetic expression evaluator.  No filesystem, no network, no state.
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression and return the result.\n\
         Supports +, -, *, /, %, parentheses, comparison and boolean operators.\n\
         Example: expr=\"(2+2)*10\" returns \"40\"."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expr": {
                    "type": "string",
                    "description": "The expression to evaluate"
                }
            },
            "required": ["expr"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(expr) = call.args.get("expr").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'expr'");
        };
        match evalexpr::eval(expr) {
            Ok(value) => ToolOutput::ok(&call.id, value.to_string()),
            Err(e) => ToolOutput::err(&call.id, format!("evaluation error: {e}")),
        }
    }
}
