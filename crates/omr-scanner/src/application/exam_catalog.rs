//! Exam catalog: read-only lookup of the exam a session grades.
//!
//! Only the identifiers are needed to build `start_scan`; question count and
//! scoring scale are shown to the operator so they can confirm they picked
//! the right exam before scanning a stack of sheets.

use async_trait::async_trait;
use omr_core::SessionParams;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exam metadata as published by the surrounding console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamMetadata {
    pub exam_id: String,
    pub template_id: String,
    #[serde(default)]
    pub question_count: u32,
    #[serde(default)]
    pub max_score: f64,
}

impl ExamMetadata {
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            exam_id: self.exam_id.clone(),
            template_id: self.template_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("unknown exam '{0}'")]
    UnknownExam(String),

    #[error("exam catalog unavailable: {0}")]
    Unavailable(String),
}

/// Read-only exam lookup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExamCatalog: Send + Sync {
    async fn lookup(&self, exam_id: &str) -> Result<ExamMetadata, CatalogError>;

    async fn list(&self) -> Result<Vec<ExamMetadata>, CatalogError>;
}

/// Catalog backed by the `[[exams]]` entries of the station config.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredCatalog {
    exams: Vec<ExamMetadata>,
}

impl ConfiguredCatalog {
    pub fn new(exams: Vec<ExamMetadata>) -> Self {
        Self { exams }
    }
}

#[async_trait]
impl ExamCatalog for ConfiguredCatalog {
    async fn lookup(&self, exam_id: &str) -> Result<ExamMetadata, CatalogError> {
        self.exams
            .iter()
            .find(|e| e.exam_id == exam_id)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownExam(exam_id.to_string()))
    }

    async fn list(&self) -> Result<Vec<ExamMetadata>, CatalogError> {
        Ok(self.exams.clone())
    }
}

/// Resolves the parameters for `start_scan`.
///
/// An explicit `template_override` wins over the catalog's template, which
/// lets an operator rescan with a corrected template without editing config.
pub async fn resolve_params(
    catalog: &dyn ExamCatalog,
    exam_id: &str,
    template_override: Option<&str>,
) -> Result<SessionParams, CatalogError> {
    let exam = catalog.lookup(exam_id).await?;
    let mut params = exam.session_params();
    if let Some(template) = template_override {
        params.template_id = template.to_string();
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn exam(id: &str, template: &str) -> ExamMetadata {
        ExamMetadata {
            exam_id: id.into(),
            template_id: template.into(),
            question_count: 10,
            max_score: 10.0,
        }
    }

    #[tokio::test]
    async fn test_configured_catalog_finds_exam() {
        let catalog = ConfiguredCatalog::new(vec![exam("exam-1", "tpl-a"), exam("exam-2", "tpl-b")]);

        let found = catalog.lookup("exam-2").await.unwrap();

        assert_eq!(found.template_id, "tpl-b");
    }

    #[tokio::test]
    async fn test_configured_catalog_unknown_exam() {
        let catalog = ConfiguredCatalog::default();

        let result = catalog.lookup("missing").await;

        assert_eq!(result, Err(CatalogError::UnknownExam("missing".into())));
    }

    #[tokio::test]
    async fn test_resolve_params_uses_catalog_template() {
        // Arrange
        let mut catalog = MockExamCatalog::new();
        catalog
            .expect_lookup()
            .with(eq("exam-1"))
            .times(1)
            .returning(|_| Ok(exam("exam-1", "tpl-a")));

        // Act
        let params = resolve_params(&catalog, "exam-1", None).await.unwrap();

        // Assert
        assert_eq!(params.exam_id, "exam-1");
        assert_eq!(params.template_id, "tpl-a");
    }

    #[tokio::test]
    async fn test_resolve_params_template_override_wins() {
        let mut catalog = MockExamCatalog::new();
        catalog
            .expect_lookup()
            .returning(|_| Ok(exam("exam-1", "tpl-a")));

        let params = resolve_params(&catalog, "exam-1", Some("tpl-fixed"))
            .await
            .unwrap();

        assert_eq!(params.template_id, "tpl-fixed");
    }

    #[tokio::test]
    async fn test_resolve_params_propagates_catalog_failure() {
        let mut catalog = MockExamCatalog::new();
        catalog
            .expect_lookup()
            .returning(|_| Err(CatalogError::Unavailable("offline".into())));

        let result = resolve_params(&catalog, "exam-1", None).await;

        assert_eq!(result, Err(CatalogError::Unavailable("offline".into())));
    }
}
