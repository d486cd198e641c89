use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

/// Placeholder stored in a job record until the external workflow calls back.
pub const PLACEHOLDER_CONTENT: &str = "Processing...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    AdCopy,
    SeoBrief,
    LinkedinAnalysis,
    Ga4Report,
}

impl JobKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ad-copy" | "ad_copy" => Some(Self::AdCopy),
            "seo-brief" | "seo_brief" => Some(Self::SeoBrief),
            "linkedin-analysis" | "linkedin_analysis" => Some(Self::LinkedinAnalysis),
            "ga4-report" | "ga4_report" => Some(Self::Ga4Report),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdCopy => "ad_copy",
            Self::SeoBrief => "seo_brief",
            Self::LinkedinAnalysis => "linkedin_analysis",
            Self::Ga4Report => "ga4_report",
        }
    }

    pub fn webhook_env_var(&self) -> &'static str {
        match self {
            Self::AdCopy => "N8N_AD_COPY_WEBHOOK_URL",
            Self::SeoBrief => "N8N_SEO_BRIEF_WEBHOOK_URL",
            Self::LinkedinAnalysis => "N8N_LINKEDIN_ANALYSIS_WEBHOOK_URL",
            Self::Ga4Report => "N8N_GA4_REPORT_WEBHOOK_URL",
        }
    }

    /// Params required before a submission is accepted.
    pub fn required_params(&self) -> &'static [&'static str] {
        match self {
            Self::AdCopy => &["campaign_name", "landing_page_url"],
            Self::SeoBrief => &["keyword"],
            Self::LinkedinAnalysis => &["company_url"],
            Self::Ga4Report => &["property_id", "start_date", "end_date"],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowJob {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub params: Value,
    pub content: Value,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub kind: String,
    pub params: Value,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSessionRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub total_tokens: i64,
    pub is_processing: bool,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageRecord {
    pub id: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub tokens: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFileRecord {
    pub id: String,
    pub session_id: String,
    pub original_name: String,
    pub stored_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub status: String,
    pub is_processed: bool,
    #[serde(default)]
    pub sheet_names: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplate {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub content: String,
    pub variables: Vec<TemplateVariable>,
    pub is_public: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVariable {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_value: String,
    /// One of: text, multiChoice, date, dateRange, select.
    #[serde(default = "default_variable_type")]
    pub variable_type: String,
    #[serde(default)]
    pub options: Vec<String>,
}

fn default_variable_type() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub name: String,
}

pub struct AppState {
    pub db: PgPool,
    pub http_client: reqwest::Client,
    pub upload_storage_dir: PathBuf,
    pub public_base_url: String,
    pub callback_secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackQuery {
    #[serde(default)]
    pub record_id: Option<String>,
    #[serde(default)]
    pub analysis_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameSessionBody {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendChatMessageBody {
    pub message: String,
    #[serde(default)]
    pub file_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateBody {
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTemplateBody {
    pub name: Option<String>,
    pub content: Option<String>,
    pub variables: Option<Vec<TemplateVariable>>,
    pub is_public: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderTemplateBody {
    #[serde(default)]
    pub values: serde_json::Map<String, Value>,
}
