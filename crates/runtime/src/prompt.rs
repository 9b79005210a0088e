//! Decision prompt assembly.

use std::fmt::Write;

use history::ExecutionHistory;

use crate::operator::INTERACTION_CATALOG;

const RESPONSE_FORMATS: &str = r#"Respond with exactly one JSON object in one of these shapes.

Function call:
{"llm_response_type": "function_call", "function": {"name": "add", "parameters": {"a": 1, "b": 2}, "reasoning_tag": "ARITHMETIC", "reasoning": "Adding two numbers"}}

User interaction:
{"llm_response_type": "user_interaction", "function": {"name": "escalate", "parameters": {"question": "Is the length in centimeters or inches?", "context": "No units were given"}, "reasoning_tag": "UNCERTAINTY", "reasoning": "Units change the answer", "confidence": "low"}}

Final answer:
{"llm_response_type": "final_answer", "result": "42", "summary": "Completed all calculations"}"#;

const PLAN_FORMAT: &str = r#"Plan:
{"llm_response_type": "plan", "steps": [{"step_number": 1, "description": "Add the numbers", "reasoning": "The query asks for a sum", "expected_tool": "add"}]}"#;

const RULES: &str = "\
Rules:
- Reply with the JSON object only. No explanations, no extra text.
- llm_response_type must be one of the shapes above. Never put a tool name there.
- Use the tool name exactly as listed, without parentheses.
- One function call per response.
- Never repeat a function call with the same parameters.
- When a tool returns several values, account for all of them.
- Give the final answer only once every step needed to answer the query is done.
- Use user_interaction, not function_call, for the interaction tools.";

/// Everything the model sees when choosing its next step.
pub struct Prompt<'a> {
    pub query: &'a str,
    pub facts: &'a [String],
    pub history: &'a ExecutionHistory,
    pub catalog: &'a str,
    pub feedback: Option<&'a str>,
    /// Ask for a plan before any tool call.
    pub require_plan: bool,
}

impl Prompt<'_> {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "USER QUERY: {}\n", self.query);

        if !self.facts.is_empty() {
            out.push_str("KNOWN FACTS:\n");
            for fact in self.facts {
                let _ = writeln!(out, "- {fact}");
            }
            out.push('\n');
        }

        let _ = writeln!(out, "AVAILABLE TOOLS:\n{}\n", self.catalog);
        let _ = writeln!(out, "USER INTERACTION TOOLS:\n{INTERACTION_CATALOG}\n");

        match self.history.plan() {
            Some(steps) => {
                out.push_str("ACCEPTED PLAN:\n");
                for step in steps {
                    let _ = write!(out, "{}. {}", step.step_number, step.description);
                    if let Some(tool) = &step.expected_tool {
                        let _ = write!(out, " (tool: {tool})");
                    }
                    out.push('\n');
                }
                out.push('\n');
            }
            None if self.require_plan => {
                out.push_str(
                    "No plan has been accepted yet. Your next response must be a plan.\n\n",
                );
            }
            None => {}
        }

        let _ = writeln!(out, "STEPS SO FAR:\n{}\n", self.history.replay());

        if let Some(feedback) = self.feedback {
            let _ = writeln!(
                out,
                "USER FEEDBACK ON YOUR LAST PROPOSAL:\n{feedback}\nRevise your next step accordingly.\n"
            );
        }

        out.push_str(RESPONSE_FORMATS);
        out.push_str("\n\n");
        if self.require_plan {
            out.push_str(PLAN_FORMAT);
            out.push_str("\n\n");
        }
        out.push_str(RULES);
        let _ = write!(out, "\n\nWhat is the next step for: {}", self.query);
        out
    }
}
