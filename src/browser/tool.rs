//! Session-scoped browser tool (spec §4.8).
//!
//! Wraps a pool [`super::manager::BrowserInstance`] (or owns a private headed
//! one) with per-session tab bookkeeping: the element-ref index used by
//! `click`/`type`/etc, and reconciliation against whatever the user did by
//! hand in the meantime.

use super::manager::{BrowserInstance, BrowserManager};
use super::url_guard::{check_url, UrlGuardError};
use chromey::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct TabInfo {
    pub target_id: String,
    pub url: String,
    pub title: String,
    /// ref -> CSS selector, rebuilt on each `snapshot(format: ai)`.
    pub element_refs: HashMap<u32, String>,
}

pub struct SessionTabs {
    pub session_key: String,
    pub profile: String,
    pub headed: bool,
    pub browser: Option<Arc<BrowserInstance>>,
    pub tabs: Vec<TabInfo>,
    pub active_tab_index: usize,
    pub closed: bool,
}

impl SessionTabs {
    pub fn new(session_key: impl Into<String>, profile: impl Into<String>, headed: bool) -> Self {
        Self {
            session_key: session_key.into(),
            profile: profile.into(),
            headed,
            browser: None,
            tabs: Vec::new(),
            active_tab_index: 0,
            closed: false,
        }
    }

    pub fn pool_key(&self) -> String {
        if self.headed {
            format!("{}-headed", self.session_key)
        } else {
            self.profile.clone()
        }
    }

    fn active_tab(&self) -> Option<&TabInfo> {
        self.tabs.get(self.active_tab_index)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrowserToolError {
    #[error(transparent)]
    UrlGuard(#[from] UrlGuardError),

    #[error(transparent)]
    Browser(#[from] super::manager::BrowserError),

    #[error("no active tab")]
    NoActiveTab,

    #[error("element ref {0} is not in the current snapshot")]
    UnknownRef(u32),

    #[error("session's browser context was lost: {0}")]
    Disconnected(String),

    #[error("cdp error: {0}")]
    Cdp(String),

    #[error("timed out waiting for {0:?}")]
    WaitTimedOut(String),
}

const MAX_INDEXED_ELEMENTS: usize = 200;
const WAIT_STABLE_IDLE_MS: u64 = 500;
const WAIT_STABLE_CAP_MS: u64 = 3_000;

/// `a, button, input, select, textarea, [role=button], [role=link], [onclick]`
/// (spec §4.8 "Element index"), capped at [`MAX_INDEXED_ELEMENTS`], returned
/// as `{tag, label, visible}` per element in source order.
const ELEMENT_INDEX_SCRIPT: &str = r#"
(() => {
  const sel = 'a, button, input, select, textarea, [role=button], [role=link], [onclick]';
  const nodes = Array.from(document.querySelectorAll(sel)).slice(0, 200);
  return nodes.map((el, i) => {
    const rect = el.getBoundingClientRect();
    const visible = rect.width > 0 && rect.height > 0 && getComputedStyle(el).visibility !== 'hidden';
    const label = (el.getAttribute('aria-label') || el.innerText || el.value || el.placeholder || '').trim();
    el.setAttribute('data-clawcore-ref', String(i + 1));
    return { tag: el.tagName.toLowerCase(), label, visible };
  });
})()
"#;

/// Format requested by `snapshot(format)` (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Text,
    Ai,
    Aria,
}

/// Either face a `click`/`type`/etc accepts: a numeric ref from the last `ai`
/// snapshot, or a raw CSS selector.
#[derive(Debug, Clone)]
pub enum Target {
    Ref(u32),
    Selector(String),
}

impl Target {
    pub fn selector(s: impl Into<String>) -> Self {
        let s = s.into();
        match s.parse::<u32>() {
            Ok(n) => Target::Ref(n),
            Err(_) => Target::Selector(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogAction {
    Accept,
    Dismiss,
}

pub struct TabSummary {
    pub target_id: String,
    pub url: String,
    pub title: String,
    pub active: bool,
}

pub enum OpResult {
    Tabs(Vec<TabSummary>),
    Text(String),
    Bytes(Vec<u8>),
    ConsoleLines(Vec<String>),
    Unit,
}

pub struct BrowserTool {
    manager: Arc<BrowserManager>,
    sessions: Mutex<HashMap<String, SessionTabs>>,
}

impl BrowserTool {
    pub fn new(manager: Arc<BrowserManager>) -> Self {
        Self {
            manager,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures a session's tab state exists, launching or attaching its
    /// browser on first use.
    async fn ensure_session(
        &self,
        session_key: &str,
        profile: &str,
        headed: bool,
    ) -> Result<(), BrowserToolError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(session_key) {
            return Ok(());
        }
        let mut tabs = SessionTabs::new(session_key, profile, headed);
        let pool_key = tabs.pool_key();
        let instance = self.manager.get_browser(&pool_key, headed).await?;
        tabs.browser = Some(instance);
        sessions.insert(session_key.to_string(), tabs);
        Ok(())
    }

    /// Reconciles a session's view of its tabs against the browser's actual
    /// open pages. Called before any operation that reads or mutates tabs
    /// (spec §4.8 "Tab reconciliation").
    pub async fn sync_tabs(&self, session_key: &str) -> Result<(), BrowserToolError> {
        let mut sessions = self.sessions.lock().await;
        let state = sessions.get_mut(session_key).ok_or(BrowserToolError::NoActiveTab)?;
        let Some(instance) = &state.browser else {
            return Ok(());
        };

        let pages = instance
            .browser
            .pages()
            .await
            .map_err(|e| BrowserToolError::Cdp(e.to_string()))?;

        let previous_active_target = state
            .tabs
            .get(state.active_tab_index)
            .map(|t| t.target_id.clone());

        let mut rebuilt = Vec::with_capacity(pages.len());
        for page in &pages {
            let target_id = page_target_id(page);
            let existing = state
                .tabs
                .iter()
                .find(|t| t.target_id == target_id)
                .cloned();
            let url = page.url().await.ok().flatten().unwrap_or_default();
            let title = page.get_title().await.ok().flatten().unwrap_or_default();
            rebuilt.push(TabInfo {
                target_id,
                url,
                title,
                element_refs: existing.map(|e| e.element_refs).unwrap_or_default(),
            });
        }

        state.active_tab_index = previous_active_target
            .and_then(|prev| rebuilt.iter().position(|t| t.target_id == prev))
            .unwrap_or_else(|| rebuilt.len().saturating_sub(1));
        state.tabs = rebuilt;

        Ok(())
    }

    /// Validates and navigates the active tab (spec §4.8 "Navigation
    /// protocol"): guard -> navigate with timeout -> wait for load ->
    /// wait-stable, the last step being best-effort since SPAs routinely
    /// never go fully idle.
    pub async fn navigate(&self, session_key: &str, url: &str) -> Result<(), BrowserToolError> {
        check_url(url).await?;
        self.sync_tabs(session_key).await?;

        let page = self.active_page(session_key).await?;
        page.goto(url).await.map_err(|e| classify_cdp_error(e.to_string()))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))?;

        wait_stable(&page).await;
        Ok(())
    }

    /// `tabs` (spec §4.8).
    pub async fn tabs(&self, session_key: &str) -> Result<Vec<TabSummary>, BrowserToolError> {
        self.sync_tabs(session_key).await?;
        let sessions = self.sessions.lock().await;
        let state = sessions.get(session_key).ok_or(BrowserToolError::NoActiveTab)?;
        Ok(state
            .tabs
            .iter()
            .enumerate()
            .map(|(i, t)| TabSummary {
                target_id: t.target_id.clone(),
                url: t.url.clone(),
                title: t.title.clone(),
                active: i == state.active_tab_index,
            })
            .collect())
    }

    /// `open(url)`: opens a new tab, validates the URL first, makes it active.
    pub async fn open(&self, session_key: &str, url: &str) -> Result<(), BrowserToolError> {
        check_url(url).await?;
        let instance = self.instance(session_key).await?;
        instance
            .browser
            .new_page(url)
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))?;
        self.sync_tabs(session_key).await
    }

    /// `focus(target_id)`: makes the named tab active.
    pub async fn focus(&self, session_key: &str, target_id: &str) -> Result<(), BrowserToolError> {
        self.sync_tabs(session_key).await?;
        let mut sessions = self.sessions.lock().await;
        let state = sessions.get_mut(session_key).ok_or(BrowserToolError::NoActiveTab)?;
        let index = state
            .tabs
            .iter()
            .position(|t| t.target_id == target_id)
            .ok_or(BrowserToolError::NoActiveTab)?;
        state.active_tab_index = index;
        Ok(())
    }

    /// `close(target_id?)`: closes a tab (defaults to the active one) and
    /// re-picks an active tab from what remains.
    pub async fn close(&self, session_key: &str, target_id: Option<&str>) -> Result<(), BrowserToolError> {
        let page = match target_id {
            Some(id) => self.page_by_target(session_key, id).await?,
            None => self.active_page(session_key).await?,
        };
        page.close().await.map_err(|e| classify_cdp_error(e.to_string()))?;
        self.sync_tabs(session_key).await
    }

    /// `snapshot(format)`: `text` returns visible body text, `aria` a
    /// best-effort accessibility summary, `ai` rebuilds the element-ref index
    /// and returns a numbered element list for `click`/`type`/etc to target.
    pub async fn snapshot(&self, session_key: &str, format: SnapshotFormat) -> Result<String, BrowserToolError> {
        let page = self.active_page(session_key).await?;
        match format {
            SnapshotFormat::Text => {
                let text = self
                    .evaluate_raw(&page, "document.body ? document.body.innerText : ''")
                    .await?;
                Ok(text)
            }
            SnapshotFormat::Aria => {
                let text = self
                    .evaluate_raw(
                        &page,
                        "JSON.stringify(Array.from(document.querySelectorAll('[role], h1, h2, h3, button, a, input')).slice(0,200).map(e => ({role: e.getAttribute('role') || e.tagName.toLowerCase(), name: (e.getAttribute('aria-label') || e.innerText || '').trim()})))",
                    )
                    .await?;
                Ok(text)
            }
            SnapshotFormat::Ai => self.rebuild_element_index(session_key, &page).await,
        }
    }

    /// `screenshot(full_page, ref?)`: whole page, or a single element when a
    /// ref/selector is given.
    pub async fn screenshot(
        &self,
        session_key: &str,
        full_page: bool,
        target: Option<Target>,
    ) -> Result<Vec<u8>, BrowserToolError> {
        let page = self.active_page(session_key).await?;
        if let Some(target) = target {
            let selector = self.resolve(session_key, target).await?;
            let element = page
                .find_element(selector)
                .await
                .map_err(|e| classify_cdp_error(e.to_string()))?;
            element
                .screenshot(ScreenshotParams::builder().build())
                .await
                .map_err(|e| classify_cdp_error(e.to_string()))
        } else {
            page.screenshot(ScreenshotParams::builder().full_page(full_page).build())
                .await
                .map_err(|e| classify_cdp_error(e.to_string()))
        }
    }

    /// `pdf()`.
    pub async fn pdf(&self, session_key: &str) -> Result<Vec<u8>, BrowserToolError> {
        let page = self.active_page(session_key).await?;
        page.pdf(Default::default())
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))
    }

    /// `click(ref|selector)`.
    pub async fn click(&self, session_key: &str, target: Target) -> Result<(), BrowserToolError> {
        let selector = self.resolve(session_key, target).await?;
        let page = self.active_page(session_key).await?;
        page.find_element(selector)
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))?
            .click()
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))?;
        Ok(())
    }

    /// `type(ref|selector, text)`: focuses the element, then types (does not
    /// clear first — use `fill` for that).
    pub async fn type_text(&self, session_key: &str, target: Target, text: &str) -> Result<(), BrowserToolError> {
        let selector = self.resolve(session_key, target).await?;
        let page = self.active_page(session_key).await?;
        let element = page
            .find_element(selector)
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))?;
        element.click().await.map_err(|e| classify_cdp_error(e.to_string()))?;
        element
            .type_str(text)
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))?;
        Ok(())
    }

    /// `fill(ref|selector, text)`: clears the field first, then types.
    pub async fn fill(&self, session_key: &str, target: Target, text: &str) -> Result<(), BrowserToolError> {
        let selector = self.resolve(session_key, target).await?;
        let page = self.active_page(session_key).await?;
        let element = page
            .find_element(selector.clone())
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))?;
        element.click().await.map_err(|e| classify_cdp_error(e.to_string()))?;
        self.evaluate_raw(
            &page,
            &format!(
                "(() => {{ const e = document.querySelector({selector:?}); if (e) {{ e.value = ''; }} }})()"
            ),
        )
        .await?;
        element
            .type_str(text)
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))?;
        Ok(())
    }

    /// `press(key)`: dispatched as a synthetic keyboard event on the
    /// currently focused element (chromey has no standalone keyboard API).
    pub async fn press(&self, session_key: &str, key: &str) -> Result<(), BrowserToolError> {
        let page = self.active_page(session_key).await?;
        self.evaluate_raw(
            &page,
            &format!(
                "(() => {{ const el = document.activeElement || document.body; const opts = {{key: {key:?}, bubbles: true}}; el.dispatchEvent(new KeyboardEvent('keydown', opts)); el.dispatchEvent(new KeyboardEvent('keyup', opts)); }})()"
            ),
        )
        .await?;
        Ok(())
    }

    /// `hover(ref|selector)`.
    pub async fn hover(&self, session_key: &str, target: Target) -> Result<(), BrowserToolError> {
        let selector = self.resolve(session_key, target).await?;
        let page = self.active_page(session_key).await?;
        page.find_element(selector.clone())
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))?
            .scroll_into_view()
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))?;
        self.evaluate_raw(
            &page,
            &format!(
                "(() => {{ const e = document.querySelector({selector:?}); if (e) {{ e.dispatchEvent(new MouseEvent('mouseover', {{bubbles: true}})); }} }})()"
            ),
        )
        .await?;
        Ok(())
    }

    /// `scroll(direction|ref)`: scrolls an element into view, or the window by
    /// a fixed step in a direction.
    pub async fn scroll(
        &self,
        session_key: &str,
        target: Option<Target>,
        direction: Option<ScrollDirection>,
    ) -> Result<(), BrowserToolError> {
        let page = self.active_page(session_key).await?;
        if let Some(target) = target {
            let selector = self.resolve(session_key, target).await?;
            page.find_element(selector)
                .await
                .map_err(|e| classify_cdp_error(e.to_string()))?
                .scroll_into_view()
                .await
                .map_err(|e| classify_cdp_error(e.to_string()))?;
            return Ok(());
        }
        let (dx, dy) = match direction.unwrap_or(ScrollDirection::Down) {
            ScrollDirection::Up => (0, -800),
            ScrollDirection::Down => (0, 800),
            ScrollDirection::Left => (-800, 0),
            ScrollDirection::Right => (800, 0),
        };
        self.evaluate_raw(&page, &format!("window.scrollBy({dx}, {dy})")).await?;
        Ok(())
    }

    /// `select(ref|selector, value)`: sets a `<select>`'s value and fires
    /// `change`.
    pub async fn select(&self, session_key: &str, target: Target, value: &str) -> Result<(), BrowserToolError> {
        let selector = self.resolve(session_key, target).await?;
        let page = self.active_page(session_key).await?;
        self.evaluate_raw(
            &page,
            &format!(
                "(() => {{ const e = document.querySelector({selector:?}); if (e) {{ e.value = {value:?}; e.dispatchEvent(new Event('change', {{bubbles: true}})); }} }})()"
            ),
        )
        .await?;
        Ok(())
    }

    /// `upload(ref|selector, file)`.
    pub async fn upload(&self, session_key: &str, target: Target, file: &Path) -> Result<(), BrowserToolError> {
        let selector = self.resolve(session_key, target).await?;
        let page = self.active_page(session_key).await?;
        page.find_element(selector)
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))?
            .set_files(vec![file.to_path_buf()])
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))?;
        Ok(())
    }

    /// `wait(selector, timeout)`: polls for the selector to appear.
    pub async fn wait(&self, session_key: &str, selector: &str, timeout: Duration) -> Result<(), BrowserToolError> {
        let page = self.active_page(session_key).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrowserToolError::WaitTimedOut(selector.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// `evaluate(js)`: runs arbitrary JS in the active tab, returns its JSON
    /// serialization.
    pub async fn evaluate(&self, session_key: &str, code: &str) -> Result<String, BrowserToolError> {
        let page = self.active_page(session_key).await?;
        self.evaluate_raw(&page, code).await
    }

    /// `console()`: drains console messages emitted in a short best-effort
    /// window (spec §8's console scenarios don't assume a persistent buffer).
    pub async fn console(&self, session_key: &str) -> Result<Vec<String>, BrowserToolError> {
        let page = self.active_page(session_key).await?;
        let mut lines = Vec::new();
        let Ok(mut events) = page
            .event_listener::<chromey::cdp::browser_protocol::runtime::EventConsoleApiCalled>()
            .await
        else {
            return Ok(lines);
        };
        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(50), events.next()).await {
                Ok(Some(event)) => lines.push(format!("{:?}: {:?}", event.r#type, event.args)),
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        Ok(lines)
    }

    /// `dialog(action, text?)`: responds to a pending `beforeunload`/`alert`/
    /// `confirm`/`prompt` dialog.
    pub async fn dialog(
        &self,
        session_key: &str,
        action: DialogAction,
        text: Option<&str>,
    ) -> Result<(), BrowserToolError> {
        let page = self.active_page(session_key).await?;
        let mut params = chromey::cdp::browser_protocol::page::HandleJavaScriptDialogParams::builder()
            .accept(action == DialogAction::Accept);
        if let Some(text) = text {
            params = params.prompt_text(text);
        }
        page.execute(params.build().map_err(|e| BrowserToolError::Cdp(e.to_string()))?)
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))?;
        Ok(())
    }

    /// Marks a session's tabs closed after the browser context itself is
    /// gone; the next operation against this session will relaunch.
    pub async fn mark_session_closed(&self, session_key: &str) {
        if let Some(state) = self.sessions.lock().await.get_mut(session_key) {
            state.closed = true;
        }
    }

    pub async fn is_closed(&self, session_key: &str) -> bool {
        self.sessions
            .lock()
            .await
            .get(session_key)
            .map(|s| s.closed)
            .unwrap_or(true)
    }

    async fn instance(&self, session_key: &str) -> Result<Arc<BrowserInstance>, BrowserToolError> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_key)
            .and_then(|s| s.browser.clone())
            .ok_or(BrowserToolError::NoActiveTab)
    }

    async fn active_page(&self, session_key: &str) -> Result<Page, BrowserToolError> {
        let sessions = self.sessions.lock().await;
        let state = sessions.get(session_key).ok_or(BrowserToolError::NoActiveTab)?;
        let instance = state.browser.clone().ok_or(BrowserToolError::NoActiveTab)?;
        let index = state.active_tab_index;
        drop(sessions);

        let pages = instance
            .browser
            .pages()
            .await
            .map_err(|e| BrowserToolError::Cdp(e.to_string()))?;
        pages.into_iter().nth(index).ok_or(BrowserToolError::NoActiveTab)
    }

    async fn page_by_target(&self, session_key: &str, target_id: &str) -> Result<Page, BrowserToolError> {
        let instance = self.instance(session_key).await?;
        let pages = instance
            .browser
            .pages()
            .await
            .map_err(|e| BrowserToolError::Cdp(e.to_string()))?;
        pages
            .into_iter()
            .find(|p| page_target_id(p) == target_id)
            .ok_or(BrowserToolError::NoActiveTab)
    }

    /// Resolves a `Target` against the active tab's element-ref index, built
    /// by the most recent `snapshot(format: ai)` call.
    async fn resolve(&self, session_key: &str, target: Target) -> Result<String, BrowserToolError> {
        match target {
            Target::Selector(s) => Ok(s),
            Target::Ref(n) => {
                let sessions = self.sessions.lock().await;
                let state = sessions.get(session_key).ok_or(BrowserToolError::NoActiveTab)?;
                state
                    .active_tab()
                    .and_then(|t| t.element_refs.get(&n))
                    .cloned()
                    .ok_or(BrowserToolError::UnknownRef(n))
            }
        }
    }

    async fn evaluate_raw(&self, page: &Page, code: &str) -> Result<String, BrowserToolError> {
        let result = page
            .evaluate(code)
            .await
            .map_err(|e| classify_cdp_error(e.to_string()))?;
        Ok(result
            .into_value::<serde_json::Value>()
            .map(|v| match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or_default())
    }

    /// Runs the element-enumeration script, assigns sequential refs to
    /// visible+labeled elements, stores the ref->selector map on the active
    /// tab, and returns the element list as the snapshot text (spec §4.8
    /// "Element index").
    async fn rebuild_element_index(&self, session_key: &str, page: &Page) -> Result<String, BrowserToolError> {
        let raw = self.evaluate_raw(page, ELEMENT_INDEX_SCRIPT).await?;
        let elements: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap_or_default();

        let mut refs = HashMap::new();
        let mut lines = Vec::new();
        let mut next_ref = 1u32;
        for (i, el) in elements.iter().take(MAX_INDEXED_ELEMENTS).enumerate() {
            let visible = el.get("visible").and_then(|v| v.as_bool()).unwrap_or(false);
            let label = el.get("label").and_then(|v| v.as_str()).unwrap_or("");
            let tag = el.get("tag").and_then(|v| v.as_str()).unwrap_or("");
            if !visible || label.is_empty() {
                continue;
            }
            let selector = format!("[data-clawcore-ref=\"{}\"]", i + 1);
            lines.push(format!("[{next_ref}] <{tag}> {label}"));
            refs.insert(next_ref, selector);
            next_ref += 1;
        }

        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.get_mut(session_key)
            && let Some(tab) = state.tabs.get_mut(state.active_tab_index)
        {
            tab.element_refs = refs;
        }

        Ok(lines.join("\n"))
    }
}

fn page_target_id(page: &Page) -> String {
    page.target_id().inner().to_string()
}

fn classify_cdp_error(msg: String) -> BrowserToolError {
    if msg.contains("context canceled") || msg.contains("connection refused") || msg.contains("closed network connection")
    {
        BrowserToolError::Disconnected(msg)
    } else {
        BrowserToolError::Cdp(msg)
    }
}

/// Polls for 500ms of network/DOM quiescence, capped at 3s total. Never
/// errors: a tab that's still busy after the cap is returned as-is.
async fn wait_stable(page: &Page) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(WAIT_STABLE_CAP_MS);
    loop {
        let before = page.content().await.ok();
        tokio::time::sleep(std::time::Duration::from_millis(WAIT_STABLE_IDLE_MS)).await;
        if tokio::time::Instant::now() >= deadline {
            return;
        }
        let after = page.content().await.ok();
        if before == after {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_headed_is_session_scoped() {
        let tabs = SessionTabs::new("primary", "default", true);
        assert_eq!(tabs.pool_key(), "primary-headed");
    }

    #[test]
    fn pool_key_headless_shares_the_profile() {
        let tabs = SessionTabs::new("primary", "default", false);
        assert_eq!(tabs.pool_key(), "default");
    }

    #[test]
    fn disconnect_messages_are_classified() {
        assert!(matches!(
            classify_cdp_error("connection refused".into()),
            BrowserToolError::Disconnected(_)
        ));
        assert!(matches!(
            classify_cdp_error("evaluation threw".into()),
            BrowserToolError::Cdp(_)
        ));
    }

    #[test]
    fn target_parses_numeric_strings_as_refs() {
        assert!(matches!(Target::selector("12"), Target::Ref(12)));
        assert!(matches!(Target::selector("#submit"), Target::Selector(s) if s == "#submit"));
    }

    #[tokio::test]
    async fn resolving_an_unknown_ref_is_an_error() {
        let manager = Arc::new(BrowserManager::new(crate::browser::BrowserConfig::default()));
        let tool = BrowserTool::new(manager);
        tool.sessions
            .lock()
            .await
            .insert("s1".to_string(), SessionTabs::new("s1", "default", false));

        let err = tool.resolve("s1", Target::Ref(7)).await.unwrap_err();
        assert!(matches!(err, BrowserToolError::UnknownRef(7)));
    }

    #[tokio::test]
    async fn resolving_a_selector_is_a_passthrough() {
        let manager = Arc::new(BrowserManager::new(crate::browser::BrowserConfig::default()));
        let tool = BrowserTool::new(manager);
        tool.sessions
            .lock()
            .await
            .insert("s1".to_string(), SessionTabs::new("s1", "default", false));

        let resolved = tool.resolve("s1", Target::Selector("#go".to_string())).await.unwrap();
        assert_eq!(resolved, "#go");
    }
}
