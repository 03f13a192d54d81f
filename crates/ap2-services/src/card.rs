//! Agent card served from `/.well-known/agent-card.json`.

use serde::{Deserialize, Serialize};

/// URI of the AP2 capability extension advertised by every role.
pub const AP2_EXTENSION_URI: &str = "https://github.com/google-agentic-commerce/ap2/tree/v0.1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extension {
    pub uri: String,
    pub params: ExtensionParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionParams {
    pub roles: Vec<String>,
}

impl AgentCard {
    /// Card advertising the AP2 extension with the given roles.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        roles: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            capabilities: Capabilities {
                extensions: vec![Extension {
                    uri: AP2_EXTENSION_URI.to_string(),
                    params: ExtensionParams {
                        roles: roles.iter().map(|r| r.to_string()).collect(),
                    },
                }],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_advertises_extension() {
        let card = AgentCard::new("merchant", "sells shoes", &["merchant"]);
        let json = serde_json::to_value(&card).unwrap();
        assert_eq!(
            json["capabilities"]["extensions"][0]["uri"],
            AP2_EXTENSION_URI
        );
        assert_eq!(
            json["capabilities"]["extensions"][0]["params"]["roles"][0],
            "merchant"
        );
    }
}
