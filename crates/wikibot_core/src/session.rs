use std::fmt;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::{ClientConfig, HttpApiClient};
use crate::error::{ApiError, AuthError, ErrorKind, api_error_code, classify_error};
use crate::page::{
    MemberBatch, PageContent, PageHandle, SaveOptions, SaveOutcome, WikiPageApi, category_title,
};
use crate::transport::{FilePart, HttpMethod, ReqwestTransport, Transport};

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Token lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated { token_valid: bool },
}

/// Authenticated view of one wiki: login, CSRF tokens and typed operations.
///
/// Owns its client exclusively; callers pass `&mut WikiSession` around
/// instead of keeping a process-wide session.
pub struct WikiSession<T: Transport> {
    client: HttpApiClient<T>,
    state: SessionState,
    csrf_token: Option<String>,
    credentials: Option<Credentials>,
    assert_mode: Option<String>,
    token_refreshes: usize,
}

impl WikiSession<ReqwestTransport> {
    pub fn connect(config: ClientConfig, transport: ReqwestTransport) -> Self {
        Self::new(HttpApiClient::new(transport, config))
    }
}

impl<T: Transport> WikiSession<T> {
    pub fn new(mut client: HttpApiClient<T>) -> Self {
        let assert_mode = client.config().assert.clone();
        client.set_assert(None);
        Self {
            client,
            state: SessionState::Unauthenticated,
            csrf_token: None,
            credentials: None,
            assert_mode,
            token_refreshes: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client(&self) -> &HttpApiClient<T> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut HttpApiClient<T> {
        &mut self.client
    }

    /// Number of times an expired token forced a refresh.
    pub fn token_refreshes(&self) -> usize {
        self.token_refreshes
    }

    pub fn login(&mut self, credentials: &Credentials) -> Result<()> {
        self.client.set_assert(None);
        self.csrf_token = None;

        let token_response = self.client.call(
            "query",
            &[("meta", "tokens".to_string()), ("type", "login".to_string())],
            HttpMethod::Get,
        )?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self.client.call(
            "login",
            &[
                ("lgname", credentials.username.clone()),
                ("lgpassword", credentials.password.clone()),
                ("lgtoken", login_token),
            ],
            HttpMethod::Post,
        )?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                info!(user = %credentials.username, "logged in");
                self.state = SessionState::Authenticated { token_valid: false };
                self.credentials = Some(credentials.clone());
                self.client.set_assert(self.assert_mode.clone());
                Ok(())
            }
            other => {
                self.state = SessionState::Unauthenticated;
                Err(AuthError {
                    username: credentials.username.clone(),
                    reason: login_payload
                        .login
                        .reason
                        .or_else(|| other.map(ToString::to_string))
                        .unwrap_or_else(|| "unknown error".to_string()),
                }
                .into())
            }
        }
    }

    pub fn logout(&mut self) -> Result<()> {
        if self.state == SessionState::Unauthenticated {
            return Ok(());
        }
        let token = self.get_csrf_token()?;
        let result = self.client.call_once(
            "logout",
            &[("token", token)],
            HttpMethod::Post,
        );
        self.state = SessionState::Unauthenticated;
        self.csrf_token = None;
        self.credentials = None;
        self.client.set_assert(None);
        result.map(|_| ())
    }

    /// Cached CSRF token, fetched on first use.
    pub fn get_csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.client.call(
            "query",
            &[("meta", "tokens".to_string()), ("type", "csrf".to_string())],
            HttpMethod::Get,
        )?;
        let parsed: TokenQueryResponse =
            serde_json::from_value(response).context("failed to decode csrf token response")?;
        let token = parsed
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki csrf token"))?;
        if let SessionState::Authenticated { .. } = self.state {
            self.state = SessionState::Authenticated { token_valid: true };
        }
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    /// POST a state-changing action with a CSRF token.
    ///
    /// `badtoken` refreshes the token; `notloggedin`/`assert*failed` log in
    /// again with the remembered credentials. Either way the call is retried
    /// exactly once and a second failure is returned as is.
    pub fn call_with_token(&mut self, action: &str, params: &[(&str, String)]) -> Result<Value> {
        self.call_with_token_and_file(action, params, None)
    }

    /// `call_with_token` with a multipart file attached to every attempt.
    pub fn call_with_token_and_file(
        &mut self,
        action: &str,
        params: &[(&str, String)],
        file: Option<&FilePart>,
    ) -> Result<Value> {
        let token = self.get_csrf_token()?;
        let error = match self.post_with_token(action, params, token, file) {
            Ok(payload) => return Ok(payload),
            Err(error) if classify_error(&error) == ErrorKind::TokenExpired => error,
            Err(error) => return Err(error),
        };

        let code = api_error_code(&error).unwrap_or_default().to_string();
        warn!(action, code = %code, "token rejected; refreshing once");
        self.csrf_token = None;
        self.token_refreshes += 1;
        if let SessionState::Authenticated { .. } = self.state {
            self.state = SessionState::Authenticated { token_valid: false };
        }
        if code != "badtoken" {
            self.relogin().context("session expired and re-login failed")?;
        }
        let token = self.get_csrf_token()?;
        self.post_with_token(action, params, token, file)
    }

    fn post_with_token(
        &mut self,
        action: &str,
        params: &[(&str, String)],
        token: String,
        file: Option<&FilePart>,
    ) -> Result<Value> {
        let mut with_token = params.to_vec();
        with_token.push(("token", token));
        match file {
            Some(file) => self.client.call_with_file(action, &with_token, file.clone()),
            None => self.client.call(action, &with_token, HttpMethod::Post),
        }
    }

    fn relogin(&mut self) -> Result<()> {
        match self.credentials.clone() {
            Some(credentials) => self.login(&credentials),
            None => {
                self.state = SessionState::Unauthenticated;
                Err(AuthError {
                    username: String::new(),
                    reason: "session expired and no credentials are remembered".to_string(),
                }
                .into())
            }
        }
    }

    pub fn get_page_text(&mut self, title: &str) -> Result<Option<PageContent>> {
        let response = self.client.call(
            "query",
            &[
                ("titles", title.to_string()),
                ("prop", "revisions".to_string()),
                ("rvprop", "content|timestamp|ids".to_string()),
                ("rvslots", "main".to_string()),
            ],
            HttpMethod::Get,
        )?;
        let parsed: QueryResponse = serde_json::from_value(response)
            .context("failed to decode page content API response")?;

        let Some(page) = parsed.query.pages.into_iter().next() else {
            return Ok(None);
        };
        if page.invalid.unwrap_or(false) {
            bail!(ApiError::new(
                "invalidtitle",
                page.invalidreason
                    .unwrap_or_else(|| format!("invalid title: {title}"))
            ));
        }
        if page.missing.unwrap_or(false) {
            return Ok(None);
        }
        let Some(revision) = page.revisions.into_iter().next() else {
            return Ok(None);
        };
        let Some(content) = revision
            .slots
            .and_then(|slots| slots.main)
            .map(|slot| slot.content)
        else {
            return Ok(None);
        };

        Ok(Some(PageContent {
            title: page.title,
            namespace: page.ns,
            body: content,
            revision_id: Some(revision.revid),
            timestamp: Some(revision.timestamp),
        }))
    }

    pub fn save_page(
        &mut self,
        title: &str,
        new_text: &str,
        summary: &str,
        options: &SaveOptions,
    ) -> Result<SaveOutcome> {
        if options.verify_unchanged {
            if let Some(current) = self.get_page_text(title)? {
                if current.body == new_text {
                    debug!(title, "content identical; skipping write");
                    return Ok(SaveOutcome::NoChange);
                }
            }
        }

        let mut params = vec![
            ("title", title.to_string()),
            ("text", new_text.to_string()),
            ("summary", summary.to_string()),
        ];
        if options.bot {
            params.push(("bot", "1".to_string()));
        }
        params.push(if options.minor {
            ("minor", "1".to_string())
        } else {
            ("notminor", "1".to_string())
        });
        if let Some(revision) = options.base_revision {
            params.push(("baserevid", revision.to_string()));
        }
        if options.no_create {
            params.push(("nocreate", "1".to_string()));
        }
        if options.create_only {
            params.push(("createonly", "1".to_string()));
        }

        let response = match self.call_with_token("edit", &params) {
            Ok(response) => response,
            Err(error) if classify_error(&error) == ErrorKind::Conflict => {
                warn!(title, "edit conflict");
                return Ok(SaveOutcome::Conflict);
            }
            Err(error) => return Err(error).with_context(|| format!("failed to save {title}")),
        };

        let parsed: EditResponse =
            serde_json::from_value(response).context("failed to decode edit response")?;
        let edit = parsed
            .edit
            .ok_or_else(|| anyhow::anyhow!("missing edit payload in API response"))?;
        if edit.result.as_deref() != Some("Success") {
            bail!(ApiError::new(
                "edit-failed",
                format!(
                    "{title}: {}",
                    edit.result.unwrap_or_else(|| "unknown".to_string())
                )
            ));
        }
        if edit.nochange.unwrap_or(false) {
            return Ok(SaveOutcome::NoChange);
        }
        Ok(SaveOutcome::Saved {
            revision_id: edit.newrevid,
        })
    }

    pub fn category_members(
        &mut self,
        category: &str,
        namespaces: &[i32],
    ) -> crate::category::CategoryMembersIter<'_, Self> {
        crate::category::CategoryMembers::new(category, namespaces).iter(self)
    }

    pub fn category_members_batch(
        &mut self,
        category: &str,
        namespaces: &[i32],
        continuation: Option<&str>,
    ) -> Result<MemberBatch> {
        let mut params = vec![
            ("list", "categorymembers".to_string()),
            ("cmtitle", category_title(category)),
            ("cmprop", "title|ids".to_string()),
            ("cmlimit", "500".to_string()),
        ];
        if !namespaces.is_empty() {
            let namespace_filter = namespaces
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("|");
            params.push(("cmnamespace", namespace_filter));
        }
        if let Some(token) = continuation {
            params.push(("cmcontinue", token.to_string()));
        }

        let response = self.client.call("query", &params, HttpMethod::Get)?;
        let parsed: QueryResponse = serde_json::from_value(response)
            .context("failed to decode categorymembers API response")?;
        Ok(MemberBatch {
            members: parsed
                .query
                .categorymembers
                .into_iter()
                .map(|item| PageHandle::new(item.title, item.ns))
                .collect(),
            continuation: parsed.continuation.and_then(|cont| cont.cmcontinue),
        })
    }

    pub fn move_page(&mut self, from: &str, to: &str, reason: &str, no_redirect: bool) -> Result<()> {
        let mut params = vec![
            ("from", from.to_string()),
            ("to", to.to_string()),
            ("reason", reason.to_string()),
            ("movetalk", "1".to_string()),
        ];
        if no_redirect {
            params.push(("noredirect", "1".to_string()));
        }
        self.call_with_token("move", &params)
            .with_context(|| format!("failed to move {from} to {to}"))?;
        info!(from, to, "moved page");
        Ok(())
    }

    /// Returns `false` when the page was already gone.
    pub fn delete_page(&mut self, title: &str, reason: &str) -> Result<bool> {
        let response = self.call_with_token(
            "delete",
            &[("title", title.to_string()), ("reason", reason.to_string())],
        );
        match response {
            Ok(_) => {
                info!(title, "deleted page");
                Ok(true)
            }
            Err(error) if api_error_code(&error) == Some("missingtitle") => Ok(false),
            Err(error) => Err(error).with_context(|| format!("failed to delete {title}")),
        }
    }

    pub fn undelete_page(&mut self, title: &str, reason: &str) -> Result<()> {
        self.call_with_token(
            "undelete",
            &[("title", title.to_string()), ("reason", reason.to_string())],
        )
        .with_context(|| format!("failed to undelete {title}"))?;
        info!(title, "undeleted page");
        Ok(())
    }

    /// Upload an XML dump through `action=import`; returns the number of pages imported.
    pub fn import_xml(
        &mut self,
        xml: Vec<u8>,
        filename: &str,
        interwiki_prefix: &str,
        full_history: bool,
    ) -> Result<usize> {
        let mut params = vec![("interwikiprefix", interwiki_prefix.to_string())];
        if full_history {
            params.push(("fullhistory", "1".to_string()));
        }
        let file = FilePart {
            field: "xml".to_string(),
            filename: filename.to_string(),
            mime: "text/xml".to_string(),
            bytes: xml,
        };
        let response = self
            .call_with_token_and_file("import", &params, Some(&file))
            .context("XML import failed")?;
        let imported = response
            .get("import")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        info!(imported, "XML import accepted");
        Ok(imported)
    }
}

impl<T: Transport> WikiPageApi for WikiSession<T> {
    fn get_page_text(&mut self, title: &str) -> Result<Option<PageContent>> {
        WikiSession::get_page_text(self, title)
    }

    fn save_page(
        &mut self,
        title: &str,
        new_text: &str,
        summary: &str,
        options: &SaveOptions,
    ) -> Result<SaveOutcome> {
        WikiSession::save_page(self, title, new_text, summary, options)
    }

    fn category_members_batch(
        &mut self,
        category: &str,
        namespaces: &[i32],
        continuation: Option<&str>,
    ) -> Result<MemberBatch> {
        WikiSession::category_members_batch(self, category, namespaces, continuation)
    }
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    categorymembers: Vec<MemberQueryItem>,
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    cmcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MemberQueryItem {
    title: String,
    #[serde(default)]
    ns: i32,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    #[serde(default)]
    ns: i32,
    title: String,
    missing: Option<bool>,
    invalid: Option<bool>,
    invalidreason: Option<String>,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    revid: i64,
    timestamp: String,
    slots: Option<RevisionSlotContainer>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlotContainer {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EditResponse {
    edit: Option<EditPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct EditPayload {
    result: Option<String>,
    nochange: Option<bool>,
    newrevid: Option<i64>,
}
