//! 浏览器通道：用 Headless Chrome 的标签页作为 Agent 通道
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! 每个提供方对应一个站点；已有同域标签页则复用，否则新开并导航。
//! 页面交互全部通过 `Tab::evaluate` 注入脚本完成，选择器来自 [`ProviderProfile`]。
//! headless_chrome 是同步 API，所有调用都放进 `spawn_blocking`。
//!
//! 后台标签页的页面可能被节流而迟迟不渲染回复：同一句柄在一次发送后第二次读取仍为空时，
//! 临时把标签页切到前台再读一次，读到回复或下一次发送时切回原来的标签页。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use tokio::sync::mpsc;

use crate::channel::{ChannelAdapter, ChannelError, ChannelHandle, ChannelLost};
use crate::config::{BrowserSection, ProviderSection};
use crate::core::AgentId;

/// 单个提供方的页面描述（选择器随站点改版可能失效，可在配置中覆盖）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub url: String,
    /// 依次尝试，第一个命中的作为输入框
    pub input_selectors: Vec<String>,
    pub submit_selectors: Vec<String>,
    /// 取最后一个命中元素的文本作为最新回复
    pub reply_selector: String,
    /// 命中即表示仍在生成
    pub busy_selector: Option<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl ProviderProfile {
    /// 内置的 chatgpt / claude / gemini
    pub fn builtin(agent_id: &str) -> Option<Self> {
        let profile = match agent_id {
            "chatgpt" => Self {
                url: "https://chat.openai.com/".into(),
                input_selectors: strings(&["#prompt-textarea", "div[contenteditable=\"true\"]"]),
                submit_selectors: strings(&[
                    "#composer-submit-button",
                    "button[data-testid=\"send-button\"]",
                ]),
                reply_selector: "[data-message-author-role=\"assistant\"]".into(),
                busy_selector: Some(".result-streaming".into()),
            },
            "claude" => Self {
                url: "https://claude.ai/".into(),
                input_selectors: strings(&[
                    "div[contenteditable=\"true\"][data-placeholder]",
                    "div[contenteditable=\"true\"]",
                ]),
                submit_selectors: strings(&[
                    "button[aria-label*=\"Send\"]",
                    "button:has(svg[data-icon=\"send\"])",
                ]),
                reply_selector: ".standard-markdown, [class*=\"standard-markdown\"]".into(),
                busy_selector: Some("button[aria-label=\"Stop generating\"]".into()),
            },
            "gemini" => Self {
                url: "https://gemini.google.com/".into(),
                input_selectors: strings(&[
                    "rich-textarea div[contenteditable=\"true\"]",
                    "div[contenteditable=\"true\"][role=\"textbox\"]",
                ]),
                submit_selectors: strings(&["button[aria-label*=\"Send\"]", "button.send-button"]),
                reply_selector: "message-content".into(),
                busy_selector: Some("[aria-busy=\"true\"]".into()),
            },
            _ => return None,
        };
        Some(profile)
    }

    /// 用配置覆盖已设置的字段；不认识的提供方必须给出 url 与 reply_selector
    pub fn resolve(agent_id: &str, overrides: Option<&ProviderSection>) -> Option<Self> {
        let base = Self::builtin(agent_id);
        let Some(o) = overrides else {
            return base;
        };
        let mut profile = match base {
            Some(p) => p,
            None => Self {
                url: o.url.clone()?,
                input_selectors: Vec::new(),
                submit_selectors: Vec::new(),
                reply_selector: o.reply_selector.clone()?,
                busy_selector: None,
            },
        };
        if let Some(url) = &o.url {
            profile.url = url.clone();
        }
        if let Some(sel) = &o.input_selectors {
            profile.input_selectors = sel.clone();
        }
        if let Some(sel) = &o.submit_selectors {
            profile.submit_selectors = sel.clone();
        }
        if let Some(sel) = &o.reply_selector {
            profile.reply_selector = sel.clone();
        }
        if o.busy_selector.is_some() {
            profile.busy_selector = o.busy_selector.clone();
        }
        Some(profile)
    }

    pub fn host(&self) -> Option<String> {
        host_of(&self.url)
    }

    fn ready_script(&self) -> String {
        format!(
            "(function() {{ const sels = {}; return sels.some(s => document.querySelector(s) !== null); }})()",
            js_value(&self.input_selectors)
        )
    }

    fn send_script(&self, text: &str) -> String {
        format!(
            r#"(function() {{
    const inputs = {inputs};
    const submits = {submits};
    const text = {text};
    let input = null;
    for (const s of inputs) {{ input = document.querySelector(s); if (input) break; }}
    if (!input) return 'no-input';
    input.focus();
    if (input.tagName === 'TEXTAREA' || input.tagName === 'INPUT') {{
        input.value = text;
    }} else {{
        input.textContent = text;
    }}
    input.dispatchEvent(new Event('input', {{ bubbles: true }}));
    let btn = null;
    for (const s of submits) {{ btn = document.querySelector(s); if (btn) break; }}
    if (!btn) return 'no-submit';
    if (btn.disabled) return 'disabled';
    btn.click();
    return 'sent';
}})()"#,
            inputs = js_value(&self.input_selectors),
            submits = js_value(&self.submit_selectors),
            text = js_value(&text),
        )
    }

    /// 仍在生成时返回空串，交给提取重试
    fn reply_script(&self) -> String {
        format!(
            r#"(function() {{
    const busy = {busy};
    if (busy && document.querySelector(busy)) return '';
    const nodes = document.querySelectorAll({reply});
    if (nodes.length === 0) return '';
    const last = nodes[nodes.length - 1];
    return (last.innerText || last.textContent || '').trim();
}})()"#,
            busy = js_value(&self.busy_selector),
            reply = js_value(&self.reply_selector),
        )
    }
}

/// 以 JSON 字面量嵌入脚本，负责转义
fn js_value<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// 从 URL 提取主机名（小写）
fn host_of(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

fn backend(e: impl std::fmt::Display) -> ChannelError {
    ChannelError::Backend(e.to_string())
}

/// 出错时先执行清理，再原样返回
fn discard_on_error<T>(
    result: Result<T, ChannelError>,
    discard: impl FnOnce(),
) -> Result<T, ChannelError> {
    if result.is_err() {
        discard();
    }
    result
}

fn evaluate(tab: &Tab, script: &str) -> Result<serde_json::Value, ChannelError> {
    let result = tab
        .evaluate(script, false)
        .map_err(|e| backend(format!("Evaluate failed: {}", e)))?;
    Ok(result.value.unwrap_or(serde_json::Value::Null))
}

fn read_text(tab: &Tab, script: &str) -> Result<String, ChannelError> {
    Ok(evaluate(tab, script)?.as_str().unwrap_or_default().to_string())
}

/// 切到前台后等页面重新渲染的时间
const RAISE_SETTLE: Duration = Duration::from_secs(1);

/// 按标签页记录自上次发送以来的读取次数，以及被临时切到前台的标签页
#[derive(Debug, Default)]
struct FocusBook {
    fetches: HashMap<String, u32>,
    /// 被切到前台的标签页 -> 之后要切回的标签页
    raised: HashMap<String, Option<String>>,
}

impl FocusBook {
    /// 记一次读取；从第二次起、且该标签页尚未在前台时返回 true
    fn record_fetch(&mut self, tab: &str) -> bool {
        let count = self.fetches.entry(tab.to_string()).or_insert(0);
        *count += 1;
        *count >= 2 && !self.raised.contains_key(tab)
    }

    fn mark_raised(&mut self, tab: &str, home: Option<String>) {
        self.raised.insert(tab.to_string(), home);
    }

    /// 已读到回复：返回要切回的标签页
    fn settle(&mut self, tab: &str) -> Option<String> {
        self.raised.remove(tab).flatten()
    }

    /// 新的一次发送：重置该标签页的计数，并取出所有待切回的标签页
    fn on_send(&mut self, tab: &str) -> Vec<String> {
        self.fetches.remove(tab);
        let mut homes: Vec<String> = self.raised.drain().filter_map(|(_, home)| home).collect();
        homes.sort();
        homes.dedup();
        homes
    }
}

struct Fetched {
    text: String,
    /// 本次读取把标签页切到了前台；内层为原来的前台标签页
    raised: Option<Option<String>>,
}

/// 基于 Chrome 标签页的通道适配器
pub struct BrowserAdapter {
    launch: LaunchSettings,
    profiles: HashMap<AgentId, ProviderProfile>,
    browser: Arc<Mutex<Option<Browser>>>,
    focus: Mutex<FocusBook>,
    loss_tx: Option<mpsc::UnboundedSender<ChannelLost>>,
}

#[derive(Debug, Clone)]
struct LaunchSettings {
    headless: bool,
    user_data_dir: Option<std::path::PathBuf>,
}

impl BrowserAdapter {
    /// 内置提供方 + 配置覆盖；浏览器在第一次需要时才启动
    pub fn new(cfg: &BrowserSection) -> Self {
        let mut profiles = HashMap::new();
        for id in ["chatgpt", "claude", "gemini"] {
            if let Some(p) = ProviderProfile::resolve(id, cfg.providers.get(id)) {
                profiles.insert(id.to_string(), p);
            }
        }
        for (id, section) in &cfg.providers {
            if profiles.contains_key(id) {
                continue;
            }
            match ProviderProfile::resolve(id, Some(section)) {
                Some(p) => {
                    profiles.insert(id.clone(), p);
                }
                None => {
                    tracing::warn!(agent = %id, "provider needs url and reply_selector, skipped");
                }
            }
        }
        Self {
            launch: LaunchSettings {
                headless: cfg.headless,
                user_data_dir: cfg.user_data_dir.clone(),
            },
            profiles,
            browser: Arc::new(Mutex::new(None)),
            focus: Mutex::new(FocusBook::default()),
            loss_tx: None,
        }
    }

    /// 标签页消失时发出 ChannelLost
    pub fn with_loss_notifier(mut self, tx: mpsc::UnboundedSender<ChannelLost>) -> Self {
        self.loss_tx = Some(tx);
        self
    }

    pub fn agents(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.profiles.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn profile(&self, agent_id: &str) -> Result<ProviderProfile, ChannelError> {
        self.profiles
            .get(agent_id)
            .cloned()
            .ok_or_else(|| ChannelError::UnknownAgent(agent_id.to_string()))
    }

    /// 取得（必要时启动）浏览器；Browser 内部为 Arc，克隆开销很小
    fn browser_blocking(
        slot: &Mutex<Option<Browser>>,
        launch: &LaunchSettings,
    ) -> Result<Browser, ChannelError> {
        let mut guard = slot.lock().map_err(backend)?;
        if let Some(b) = guard.as_ref() {
            return Ok(b.clone());
        }
        let options = LaunchOptions::default_builder()
            .headless(launch.headless)
            .user_data_dir(launch.user_data_dir.clone())
            .build()
            .map_err(backend)?;
        tracing::info!(headless = launch.headless, "launching chrome");
        let browser = Browser::new(options).map_err(|e| backend(format!("Chrome launch failed: {}", e)))?;
        *guard = Some(browser.clone());
        Ok(browser)
    }

    fn find_tab(browser: &Browser, target_id: &str) -> Result<Option<Arc<Tab>>, ChannelError> {
        let tabs = browser.get_tabs().lock().map_err(backend)?;
        Ok(tabs
            .iter()
            .find(|t| t.get_target_id().as_str() == target_id)
            .cloned())
    }

    /// 除 `target_id` 外的任一标签页，作为切回的目标
    fn other_tab(browser: &Browser, target_id: &str) -> Result<Option<String>, ChannelError> {
        let tabs = browser.get_tabs().lock().map_err(backend)?;
        Ok(tabs
            .iter()
            .map(|t| t.get_target_id().to_string())
            .find(|id| id != target_id))
    }

    fn focus_book(&self) -> Result<MutexGuard<'_, FocusBook>, ChannelError> {
        self.focus.lock().map_err(backend)
    }

    /// 把焦点还给之前的标签页；失败只记日志
    async fn restore_focus(&self, targets: Vec<String>) {
        if targets.is_empty() {
            return;
        }
        let slot = Arc::clone(&self.browser);
        let launch = self.launch.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let browser = Self::browser_blocking(&slot, &launch)?;
            for target in &targets {
                if let Some(tab) = Self::find_tab(&browser, target)? {
                    tab.activate()
                        .map_err(|e| backend(format!("Activate failed: {}", e)))?;
                    tracing::debug!(tab = %target, "focus restored");
                }
            }
            Ok::<_, ChannelError>(())
        })
        .await
        .map_err(backend);
        if let Err(e) = outcome.and_then(|r| r) {
            tracing::warn!("failed to restore tab focus: {}", e);
        }
    }

    fn notify_lost(&self, handle: &ChannelHandle) {
        if let Some(tx) = &self.loss_tx {
            let _ = tx.send(ChannelLost {
                agent_id: handle.agent_id.clone(),
                handle: Some(handle.id.clone()),
            });
        }
    }

    /// 在句柄对应的标签页上执行脚本；标签页不存在时发出丢失通知并返回 NotFound
    async fn eval(&self, handle: &ChannelHandle, script: String) -> Result<serde_json::Value, ChannelError> {
        let slot = Arc::clone(&self.browser);
        let launch = self.launch.clone();
        let target = handle.id.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            let browser = Self::browser_blocking(&slot, &launch)?;
            let Some(tab) = Self::find_tab(&browser, &target)? else {
                return Ok(None);
            };
            Ok::<_, ChannelError>(Some(evaluate(&tab, &script)?))
        })
        .await
        .map_err(backend)?;

        match outcome? {
            Some(v) => Ok(v),
            None => {
                self.notify_lost(handle);
                Err(ChannelError::NotFound(format!("tab {} closed", handle.id)))
            }
        }
    }
}

#[async_trait]
impl ChannelAdapter for BrowserAdapter {
    async fn ensure_channel(&self, agent_id: &str) -> Result<ChannelHandle, ChannelError> {
        let profile = self.profile(agent_id)?;
        let host = profile
            .host()
            .ok_or_else(|| ChannelError::Rejected(format!("invalid url: {}", profile.url)))?;
        let slot = Arc::clone(&self.browser);
        let launch = self.launch.clone();
        let url = profile.url.clone();

        let (target_id, reused) = tokio::task::spawn_blocking(move || {
            let browser = Self::browser_blocking(&slot, &launch)?;
            {
                let tabs = browser.get_tabs().lock().map_err(backend)?;
                if let Some(tab) = tabs
                    .iter()
                    .find(|t| host_of(&t.get_url()).as_deref() == Some(host.as_str()))
                {
                    return Ok::<_, ChannelError>((tab.get_target_id().to_string(), true));
                }
            }
            let tab = browser
                .new_tab()
                .map_err(|e| backend(format!("Browser tab failed: {}", e)))?;
            let loaded = tab
                .navigate_to(&url)
                .map_err(|e| backend(format!("Navigate failed: {}", e)))
                .and_then(|t| {
                    t.wait_until_navigated()
                        .map_err(|e| ChannelError::NotReady(format!("Page load failed: {}", e)))
                })
                .map(|_| ());
            discard_on_error(loaded, || {
                if let Err(e) = tab.close(false) {
                    tracing::warn!(url = %url, "failed to close tab after load error: {}", e);
                }
            })?;
            Ok((tab.get_target_id().to_string(), false))
        })
        .await
        .map_err(backend)??;

        tracing::info!(agent = %agent_id, tab = %target_id, reused, "browser channel ready");
        Ok(ChannelHandle::new(agent_id, target_id))
    }

    async fn is_alive(&self, handle: &ChannelHandle) -> bool {
        let slot = Arc::clone(&self.browser);
        let target = handle.id.clone();
        tokio::task::spawn_blocking(move || {
            let guard = slot.lock().ok()?;
            let browser = guard.as_ref()?;
            Self::find_tab(browser, &target).ok().flatten().map(|_| ())
        })
        .await
        .ok()
        .flatten()
        .is_some()
    }

    async fn check_ready(&self, handle: &ChannelHandle) -> Result<bool, ChannelError> {
        let profile = self.profile(&handle.agent_id)?;
        let value = self.eval(handle, profile.ready_script()).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn send_prompt(&self, handle: &ChannelHandle, text: &str) -> Result<(), ChannelError> {
        let profile = self.profile(&handle.agent_id)?;
        let homes = self.focus_book()?.on_send(&handle.id);
        self.restore_focus(homes).await;
        let value = self.eval(handle, profile.send_script(text)).await?;
        match value.as_str() {
            Some("sent") => Ok(()),
            Some("no-input") => Err(ChannelError::Rejected("Input field not found".into())),
            Some("no-submit") => Err(ChannelError::Rejected("Send button not found".into())),
            Some("disabled") => Err(ChannelError::Rejected("Send button is disabled".into())),
            other => Err(ChannelError::Backend(format!(
                "unexpected send result: {:?}",
                other
            ))),
        }
    }

    async fn fetch_reply(&self, handle: &ChannelHandle) -> Result<String, ChannelError> {
        let profile = self.profile(&handle.agent_id)?;
        let may_raise = self.focus_book()?.record_fetch(&handle.id);
        let slot = Arc::clone(&self.browser);
        let launch = self.launch.clone();
        let target = handle.id.clone();
        let script = profile.reply_script();

        let outcome = tokio::task::spawn_blocking(move || {
            let browser = Self::browser_blocking(&slot, &launch)?;
            let Some(tab) = Self::find_tab(&browser, &target)? else {
                return Ok(None);
            };
            let text = read_text(&tab, &script)?;
            if !text.is_empty() || !may_raise {
                return Ok(Some(Fetched { text, raised: None }));
            }
            let home = Self::other_tab(&browser, &target)?;
            if let Err(e) = tab.activate() {
                tracing::warn!(tab = %target, "failed to activate tab: {}", e);
                return Ok(Some(Fetched { text, raised: None }));
            }
            std::thread::sleep(RAISE_SETTLE);
            let text = read_text(&tab, &script)?;
            Ok::<_, ChannelError>(Some(Fetched {
                text,
                raised: Some(home),
            }))
        })
        .await
        .map_err(backend)?;

        let Some(fetched) = outcome? else {
            self.notify_lost(handle);
            return Err(ChannelError::NotFound(format!("tab {} closed", handle.id)));
        };
        if let Some(home) = fetched.raised {
            tracing::debug!(agent = %handle.agent_id, tab = %handle.id, "background tab raised to read reply");
            self.focus_book()?.mark_raised(&handle.id, home);
        }
        if !fetched.text.is_empty() {
            let home = self.focus_book()?.settle(&handle.id);
            self.restore_focus(home.into_iter().collect()).await;
        }
        Ok(fetched.text)
    }
}
