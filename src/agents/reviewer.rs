// src/agents/reviewer.rs — Design-space reviewer
//
// Approves a configuration only when every parameter is part of the design
// space and takes one of its allowed values. Rejections carry the
// configuration id so a planner can steer away from it.

use async_trait::async_trait;

use super::{DesignSpace, ReviewVerdict, Reviewer};
use crate::core::types::Configuration;
use crate::infra::errors::CollaboratorError;

pub struct DesignSpaceReviewer {
    space: DesignSpace,
}

impl DesignSpaceReviewer {
    pub fn new(space: DesignSpace) -> Self {
        Self { space }
    }
}

#[async_trait]
impl Reviewer for DesignSpaceReviewer {
    fn name(&self) -> &str {
        "design-space-reviewer"
    }

    async fn review(&self, config: &Configuration) -> Result<ReviewVerdict, CollaboratorError> {
        if let Err(e) = config.validate() {
            return Ok(ReviewVerdict::reject(format!("{}: {e}", config.id())));
        }
        // An empty space places no constraints.
        if self.space.is_empty() {
            return Ok(ReviewVerdict::approve());
        }
        let violations = self.space.violations(config);
        if violations.is_empty() {
            Ok(ReviewVerdict::approve())
        } else {
            Ok(ReviewVerdict::reject(format!(
                "{}: {}",
                config.id(),
                violations.join("; ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ParamValue;

    fn reviewer() -> DesignSpaceReviewer {
        DesignSpaceReviewer::new(
            DesignSpace::new().with("a", vec![ParamValue::Int(1), ParamValue::Int(2)]),
        )
    }

    #[tokio::test]
    async fn test_approves_config_in_space() {
        let c = Configuration::from_pairs([("a", 2i64)]).unwrap();
        let v = reviewer().review(&c).await.unwrap();
        assert!(v.approved);
        assert!(v.feedback.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_with_config_id_in_feedback() {
        let c = Configuration::from_pairs([("a", 5i64)]).unwrap();
        let v = reviewer().review(&c).await.unwrap();
        assert!(!v.approved);
        assert!(v.feedback.starts_with(c.id().as_str()));
        assert!(v.feedback.contains("value 5"));
    }

    #[tokio::test]
    async fn test_empty_space_approves_everything() {
        let r = DesignSpaceReviewer::new(DesignSpace::new());
        let c = Configuration::from_pairs([("anything", 1i64)]).unwrap();
        assert!(r.review(&c).await.unwrap().approved);
    }
}
