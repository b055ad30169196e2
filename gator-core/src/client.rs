use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
pub const SHORTCUT_MIME_TYPE: &str = "application/vnd.google-apps.shortcut";

const FILE_FIELDS: &str =
    "id,name,mimeType,md5Checksum,size,parents,trashed,capabilities,shortcutDetails,owners";
const CHANGE_FIELDS: &str = "nextPageToken,newStartPageToken,changes(fileId,removed,file(id,name,mimeType,md5Checksum,size,parents,trashed))";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    Permission,
    NotFound,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn get_start_page_token(&self) -> Result<String, DriveError> {
        let url = self.endpoint("/drive/v3/changes/startPageToken")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let token: StartPageToken = Self::handle_response(response).await?;
        Ok(token.start_page_token)
    }

    pub async fn list_changes(&self, page_token: &str) -> Result<ChangeList, DriveError> {
        let mut url = self.endpoint("/drive/v3/changes")?;
        url.query_pairs_mut()
            .append_pair("pageToken", page_token)
            .append_pair("fields", CHANGE_FIELDS)
            .append_pair("includeRemoved", "true");
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn watch_changes(
        &self,
        page_token: &str,
        channel_id: &str,
        address: &str,
    ) -> Result<Channel, DriveError> {
        let mut url = self.endpoint("/drive/v3/changes/watch")?;
        url.query_pairs_mut().append_pair("pageToken", page_token);
        let body = ChannelRequest {
            id: channel_id.to_string(),
            channel_type: "web_hook".to_string(),
            address: address.to_string(),
        };
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn stop_channel(&self, id: &str, resource_id: &str) -> Result<(), DriveError> {
        let url = self.endpoint("/drive/v3/channels/stop")?;
        let body = StopRequest {
            id: id.to_string(),
            resource_id: resource_id.to_string(),
        };
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&body)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(DriveError::Api { status, body })
    }

    pub async fn get_file(&self, file_id: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{file_id}"))?;
        url.query_pairs_mut().append_pair("fields", FILE_FIELDS);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Lists every file matching a Drive query, following pagination.
    pub async fn list_files_all(&self, query: &str) -> Result<Vec<DriveFile>, DriveError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.endpoint("/drive/v3/files")?;
            {
                let mut pairs = url.query_pairs_mut();
                pairs.append_pair("q", query);
                pairs.append_pair("fields", &format!("nextPageToken,files({FILE_FIELDS})"));
                pairs.append_pair("spaces", "drive");
                if let Some(token) = &page_token {
                    pairs.append_pair("pageToken", token);
                }
            }
            let response = self
                .http
                .get(url)
                .header("Authorization", self.auth_header_value())
                .send()
                .await?;
            let page: FileList = Self::handle_response(response).await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }

    pub async fn list_child_folders(&self, parent_id: &str) -> Result<Vec<DriveFile>, DriveError> {
        let query =
            format!("'{parent_id}' in parents and mimeType = '{FOLDER_MIME_TYPE}' and trashed = false");
        self.list_files_all(&query).await
    }

    pub async fn list_shortcuts_to(&self, target_id: &str) -> Result<Vec<DriveFile>, DriveError> {
        let query = format!(
            "shortcutDetails.targetId = '{target_id}' and mimeType = '{SHORTCUT_MIME_TYPE}' and trashed = false"
        );
        self.list_files_all(&query).await
    }

    pub async fn list_shared_with_me(&self) -> Result<Vec<DriveFile>, DriveError> {
        let query = format!("sharedWithMe and mimeType = '{FOLDER_MIME_TYPE}' and trashed = false");
        self.list_files_all(&query).await
    }

    pub async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<DriveFile, DriveError> {
        let body = CreateFileRequest {
            name: Some(name.to_string()),
            mime_type: Some(FOLDER_MIME_TYPE.to_string()),
            parents: vec![parent_id.to_string()],
            shortcut_details: None,
        };
        self.create_file(&body).await
    }

    pub async fn create_shortcut(
        &self,
        target_id: &str,
        parent_id: &str,
        name: Option<&str>,
    ) -> Result<DriveFile, DriveError> {
        let body = CreateFileRequest {
            name: name.map(str::to_string),
            mime_type: Some(SHORTCUT_MIME_TYPE.to_string()),
            parents: vec![parent_id.to_string()],
            shortcut_details: Some(ShortcutDetails {
                target_id: target_id.to_string(),
            }),
        };
        self.create_file(&body).await
    }

    async fn create_file(&self, body: &CreateFileRequest) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        url.query_pairs_mut().append_pair("fields", FILE_FIELDS);
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_file(&self, file_id: &str) -> Result<(), DriveError> {
        let url = self.endpoint(&format!("/drive/v3/files/{file_id}"))?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(DriveError::Api { status, body })
    }

    pub async fn update_parents(
        &self,
        file_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{file_id}"))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("fields", FILE_FIELDS);
            if !add.is_empty() {
                pairs.append_pair("addParents", &add.join(","));
            }
            if !remove.is_empty() {
                pairs.append_pair("removeParents", &remove.join(","));
            }
        }
        let response = self
            .http
            .patch(url)
            .header("Authorization", self.auth_header_value())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body("{}")
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn download(&self, file_id: &str) -> Result<reqwest::Response, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{file_id}"))?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(DriveError::Api { status, body })
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::NotFound))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        ApiErrorClass::Auth
    } else if status == StatusCode::FORBIDDEN {
        ApiErrorClass::Permission
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartPageToken {
    start_page_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelRequest {
    id: String,
    #[serde(rename = "type")]
    channel_type: String,
    address: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest {
    id: String,
    resource_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub resource_id: String,
    #[serde(default)]
    pub resource_uri: Option<String>,
    /// Expiry as milliseconds since the unix epoch.
    #[serde(deserialize_with = "de_int64")]
    pub expiration: i64,
}

// The API encodes int64 fields as decimal JSON strings; accept bare
// numbers as well.
fn de_int64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Num(i64),
        Text(String),
    }
    match Int64::deserialize(deserializer)? {
        Int64::Num(n) => Ok(n),
        Int64::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn de_opt_uint64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Uint64 {
        Num(u64),
        Text(String),
    }
    match Option::<Uint64>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Uint64::Num(n)) => Ok(Some(n)),
        Some(Uint64::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateFileRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<String>,
    parents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shortcut_details: Option<ShortcutDetails>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutDetails {
    pub target_id: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub can_move_item_within_drive: bool,
    #[serde(default)]
    pub can_edit: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default, deserialize_with = "de_opt_uint64")]
    pub size: Option<u64>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
    #[serde(default)]
    pub shortcut_details: Option<ShortcutDetails>,
    #[serde(default)]
    pub owners: Vec<User>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub file_id: String,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub file: Option<DriveFile>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeList {
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub new_start_page_token: Option<String>,
}
