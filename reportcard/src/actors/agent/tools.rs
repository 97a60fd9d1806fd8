//! Tool declarations and turn wire types for the profile agent.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

pub const SUBMIT_PROFILE_TOOL: &str = "submit_github_profile";
pub const GH_TOOL: &str = "gh";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments object
    pub parameters: serde_json::Value,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw JSON argument string as produced by the model
    pub arguments: String,
}

impl fmt::Display for ToolCallRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ID:{} Name:{} Arguments:{}}}",
            self.id, self.name, self.arguments
        )
    }
}

/// Format a batch of calls for the transcript.
pub fn format_calls(calls: &[ToolCallRequest]) -> String {
    let parts: Vec<String> = calls.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(" "))
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnRequest {
    /// Continuation token from the previous turn; `None` on the first turn
    pub previous_response_id: Option<String>,
    pub input_text: Option<String>,
    /// call id -> output, fed back for the previous turn's calls
    pub tool_outputs: BTreeMap<String, String>,
    pub tools: Vec<ToolDeclaration>,
    /// Forces tool use when set (e.g. "required")
    pub tool_choice: Option<String>,
}

impl TurnRequest {
    pub fn initial(instruction: &str, tools: Vec<ToolDeclaration>) -> Self {
        Self {
            input_text: Some(instruction.to_string()),
            tools,
            ..Default::default()
        }
    }

    pub fn continuation(
        previous_response_id: String,
        tool_outputs: BTreeMap<String, String>,
        reminder: Option<String>,
        tools: Vec<ToolDeclaration>,
    ) -> Self {
        Self {
            previous_response_id: Some(previous_response_id),
            input_text: reminder,
            tool_outputs,
            tools,
            tool_choice: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TurnResult {
    pub response_id: String,
    pub assistant_text: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GhArguments {
    pub command: String,
}

/// Structured tool error output, always valid JSON.
pub(crate) fn tool_error(message: impl Into<String>) -> String {
    json!({ "error": message.into() }).to_string()
}

pub fn submit_profile_tool() -> ToolDeclaration {
    let string = || json!({"type": "string"});
    let integer = || json!({"type": "integer"});

    ToolDeclaration {
        name: SUBMIT_PROFILE_TOOL.to_string(),
        description: "Submit the final GitHub profile information.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "username": string(),
                "bio": string(),
                "location": string(),
                "website": string(),
                "public_repos": integer(),
                "original_repos": integer(),
                "forked_repos": integer(),
                "languages": {"type": "array", "items": string()},
                "top_repositories": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": string(),
                            "description": string(),
                            "language": string(),
                            "stars": integer(),
                            "forks": integer(),
                            "is_fork": {"type": "boolean"}
                        },
                        "required": ["name", "description", "language", "stars", "forks", "is_fork"],
                        "additionalProperties": false
                    }
                },
                "contribution_graph": {
                    "type": "object",
                    "properties": {
                        "total_contributions": integer(),
                        "streak": integer(),
                        "contributions": {"type": "object", "additionalProperties": integer()}
                    },
                    "required": ["total_contributions", "streak"],
                    "additionalProperties": false
                },
                "professional_summary": string(),
                "code_snippets": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "repository": string(),
                            "file_path": string(),
                            "content": string(),
                            "language": string()
                        },
                        "required": ["repository", "file_path", "content", "language"],
                        "additionalProperties": false
                    }
                }
            },
            "required": [
                "username", "bio", "location", "website", "public_repos", "original_repos",
                "forked_repos", "languages", "top_repositories", "contribution_graph",
                "professional_summary", "code_snippets"
            ],
            "additionalProperties": false
        }),
    }
}

pub fn gh_tool() -> ToolDeclaration {
    ToolDeclaration {
        name: GH_TOOL.to_string(),
        description: "Execute a GitHub CLI command. Examples: `gh api users/USERNAME`, \
            `gh repo list USERNAME --source --no-forks --json name,pushedAt`, \
            `gh commit list --repo OWNER/REPO -L 5`, \
            `gh commit view SHA --repo OWNER/REPO --patch`, \
            `gh repo view OWNER/REPO --json name,pushedAt`"
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The `gh` command arguments to execute. Do not include 'gh' in the command."
                }
            },
            "required": ["command"],
            "additionalProperties": false
        }),
    }
}

/// Tool set handed to every turn of the profile agent.
pub fn profile_agent_tools() -> Vec<ToolDeclaration> {
    vec![submit_profile_tool(), gh_tool()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_calls() {
        let calls = vec![
            ToolCallRequest {
                id: "c1".to_string(),
                name: GH_TOOL.to_string(),
                arguments: r#"{"command":"api users/octocat"}"#.to_string(),
            },
            ToolCallRequest {
                id: "c2".to_string(),
                name: "other".to_string(),
                arguments: "{}".to_string(),
            },
        ];
        assert_eq!(
            format_calls(&calls),
            r#"[{ID:c1 Name:gh Arguments:{"command":"api users/octocat"}} {ID:c2 Name:other Arguments:{}}]"#
        );
    }

    #[test]
    fn test_tool_error_is_valid_json() {
        let output = tool_error(r#"bad "quote""#);
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["error"], r#"bad "quote""#);
    }

    #[test]
    fn test_submit_schema_requires_profile_fields() {
        let tool = submit_profile_tool();
        let required = tool.parameters["required"].as_array().unwrap();
        assert_eq!(required.len(), 12);
        assert!(required.iter().any(|v| v == "code_snippets"));
        assert_eq!(profile_agent_tools().len(), 2);
    }
}
