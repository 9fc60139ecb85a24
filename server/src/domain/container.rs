//! Compose-managed container projection

use serde::{Deserialize, Serialize};

/// Read-only view of a compose-managed unit, produced by querying the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub ports: String,
    /// Compose service name, when the runtime reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl ContainerInfo {
    /// Whether this container backs the given compose service
    pub fn belongs_to(&self, service: &str) -> bool {
        match &self.service {
            Some(s) => s == service,
            None => {
                self.name == service
                    || self.name.contains(&format!("-{}-", service))
                    || self.name.contains(&format!("_{}_", service))
            }
        }
    }

    /// Health as reported inside the runtime's status text
    pub fn health(&self) -> &'static str {
        let status = self.status.to_lowercase();
        if status.contains("unhealthy") {
            "unhealthy"
        } else if status.contains("healthy") {
            "healthy"
        } else if status.starts_with("up") || status.contains("running") {
            "running"
        } else {
            "unhealthy"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(status: &str) -> ContainerInfo {
        ContainerInfo {
            id: "abc".into(),
            name: "ollama".into(),
            image: "ollama/ollama".into(),
            status: status.into(),
            ports: String::new(),
            service: None,
        }
    }

    #[test]
    fn test_health_from_status_text() {
        assert_eq!(info("Up 3 minutes (healthy)").health(), "healthy");
        assert_eq!(info("Up 3 minutes (unhealthy)").health(), "unhealthy");
        assert_eq!(info("running").health(), "running");
        assert_eq!(info("Exited (1) 2 seconds ago").health(), "unhealthy");
    }

    #[test]
    fn test_belongs_to_by_name_convention() {
        let mut c = info("running");
        c.name = "stack-ollama-1".into();
        assert!(c.belongs_to("ollama"));
        assert!(!c.belongs_to("llama"));
        c.service = Some("llm".into());
        assert!(c.belongs_to("llm"));
        assert!(!c.belongs_to("ollama"));
    }
}
