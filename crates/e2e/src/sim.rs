//! Simulated mail client
//!
//! An in-memory mail client that answers to the same [`SelectorProfile`] as a
//! real one. Sent mail is delivered after a delay measured on the tokio clock,
//! so tests running with paused time see deterministic arrival. Faults can be
//! injected per control: transient interactability failures, controls that
//! never render, mail arriving from the wrong originator, and unrelated mail
//! landing mid-run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::SelectorProfile;
use crate::correlator::MailboxEntry;
use crate::driver::{Driver, ElementHandle, Selector};
use crate::error::{DriverError, DriverResult};

/// Every control the simulated client renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    Identifier,
    IdentifierNext,
    Password,
    PasswordNext,
    InboxReady,
    Compose,
    To,
    Subject,
    Body,
    MoreOptions,
    LabelMenu,
    LabelOption,
    Send,
    InboxList,
    InboxRow,
    EmptyMarker,
    NewestOriginator,
    NewestSubject,
    NewestTime,
    NewestStar,
    NewestOpen,
    MessageMoreOptions,
    MessageLabelMenu,
    MessageLabelOption,
    OpenedSubject,
    OpenedBody,
}

/// Behaviour knobs for the simulated server.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Delay between send and the message showing up in the inbox
    pub delivery_delay: Duration,
    /// Originator text shown for delivered mail
    pub deliver_as: String,
    /// Sent mail never arrives
    pub drop_deliveries: bool,
    /// Labels applied at compose time are lost in transit
    pub strip_labels: bool,
    /// Replace the body of delivered mail
    pub body_override: Option<String>,
    /// Credential the sign-in form accepts; `None` accepts anything
    pub credential: Option<String>,
    /// Text of the empty-inbox marker
    pub empty_text: String,
    /// Labels offered in the label menus
    pub labels: Vec<String>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            delivery_delay: Duration::from_secs(3),
            deliver_as: "me".to_string(),
            drop_deliveries: false,
            strip_labels: false,
            body_override: None,
            credential: None,
            empty_text: "No new mail!".to_string(),
            labels: ["Social", "Updates", "Promotions", "Forums"].map(String::from).to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMail {
    id: u64,
    originator: String,
    subject: String,
    body: String,
    labels: Vec<String>,
    starred: bool,
    timestamp: String,
}

#[derive(Debug, Default)]
struct MailState {
    /// Newest first
    inbox: Vec<StoredMail>,
    pending: Vec<(Instant, StoredMail)>,
    next_id: u64,
    sends: u32,
    compose_opened: u32,
    sessions_opened: u32,
    sessions_closed: u32,
    flaky: HashMap<Control, u32>,
    missing: HashSet<Control>,
}

impl MailState {
    fn allocate(&mut self, originator: &str, subject: &str, body: &str, labels: Vec<String>) -> StoredMail {
        self.next_id += 1;
        StoredMail {
            id: self.next_id,
            originator: originator.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            labels,
            starred: false,
            timestamp: chrono::Utc::now().format("%b %-d, %Y, %-I:%M %p").to_string(),
        }
    }

    /// Move mail whose delivery time has passed into the inbox.
    fn deliver_due(&mut self) {
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|(at, _)| *at <= now);
        self.pending = waiting;
        let mut due = due;
        due.sort_by_key(|(at, mail)| (*at, mail.id));
        for (_, mail) in due {
            debug!(id = mail.id, originator = %mail.originator, "sim: delivered");
            self.inbox.insert(0, mail);
        }
    }
}

struct Shared {
    options: SimOptions,
    mail: Mutex<MailState>,
}

/// The simulated mail server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimMailClient {
    shared: Arc<Shared>,
}

impl SimMailClient {
    pub fn new(options: SimOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                mail: Mutex::new(MailState::default()),
            }),
        }
    }

    /// Open a browser session against this client.
    pub fn session(&self, selectors: &SelectorProfile) -> SimSession {
        self.shared.mail.lock().sessions_opened += 1;
        let (controls, label_options) = control_map(selectors, &self.shared.options.labels);
        SimSession {
            shared: self.shared.clone(),
            controls,
            label_options,
            login_url: selectors.login_url.clone(),
            checked_attribute: selectors.label_checked_attribute.clone(),
            timestamp_attribute: selectors.timestamp_attribute.clone(),
            page: Mutex::new(Page::default()),
        }
    }

    /// Put mail into the inbox immediately, oldest first.
    pub fn seed<'a>(&self, originators: impl IntoIterator<Item = &'a str>) {
        let mut mail = self.shared.mail.lock();
        for originator in originators {
            let stored = mail.allocate(originator, "seeded", "seeded", Vec::new());
            mail.inbox.insert(0, stored);
        }
    }

    /// Deliver unrelated mail `after` from now.
    pub fn deliver_external(&self, originator: &str, subject: &str, after: Duration) {
        let mut mail = self.shared.mail.lock();
        let stored = mail.allocate(originator, subject, "", Vec::new());
        mail.pending.push((Instant::now() + after, stored));
    }

    /// Make the next `times` clicks or keystrokes on `control` fail as not interactable.
    pub fn fail_next(&self, control: Control, times: u32) {
        self.shared.mail.lock().flaky.insert(control, times);
    }

    /// Stop rendering `control` altogether.
    pub fn remove_control(&self, control: Control) {
        self.shared.mail.lock().missing.insert(control);
    }

    pub fn inbox(&self) -> Vec<MailboxEntry> {
        let mut mail = self.shared.mail.lock();
        mail.deliver_due();
        mail.inbox
            .iter()
            .map(|m| MailboxEntry {
                originator: m.originator.clone(),
                subject: m.subject.clone(),
                timestamp: Some(m.timestamp.clone()),
            })
            .collect()
    }

    /// Labels carried by the newest inbox entry.
    pub fn newest_labels(&self) -> Vec<String> {
        let mut mail = self.shared.mail.lock();
        mail.deliver_due();
        mail.inbox.first().map(|m| m.labels.clone()).unwrap_or_default()
    }

    pub fn starred_count(&self) -> usize {
        self.shared.mail.lock().inbox.iter().filter(|m| m.starred).count()
    }

    /// Number of times the send control was activated.
    pub fn sends(&self) -> u32 {
        self.shared.mail.lock().sends
    }

    /// Number of compose windows opened.
    pub fn compose_opened(&self) -> u32 {
        self.shared.mail.lock().compose_opened
    }

    pub fn sessions_opened(&self) -> u32 {
        self.shared.mail.lock().sessions_opened
    }

    pub fn sessions_closed(&self) -> u32 {
        self.shared.mail.lock().sessions_closed
    }
}

/// Map every locator in the profile to the control it reaches. Label option
/// locators are expanded once per offered label; the second map remembers
/// which label each expansion names.
fn control_map(s: &SelectorProfile, labels: &[String]) -> (HashMap<Selector, Control>, HashMap<Selector, String>) {
    let mut pairs = vec![
        (&s.identifier_input, Control::Identifier),
        (&s.identifier_next, Control::IdentifierNext),
        (&s.password_input, Control::Password),
        (&s.password_next, Control::PasswordNext),
        (&s.inbox_ready, Control::InboxReady),
        (&s.compose_button, Control::Compose),
        (&s.to_input, Control::To),
        (&s.subject_input, Control::Subject),
        (&s.body_input, Control::Body),
        (&s.more_options, Control::MoreOptions),
        (&s.label_menu, Control::LabelMenu),
        (&s.send_button, Control::Send),
        (&s.inbox_rows, Control::InboxRow),
        (&s.newest_originator, Control::NewestOriginator),
        (&s.newest_subject, Control::NewestSubject),
        (&s.star_toggle, Control::NewestStar),
        (&s.open_newest, Control::NewestOpen),
        (&s.message_more_options, Control::MessageMoreOptions),
        (&s.message_label_menu, Control::MessageLabelMenu),
        (&s.opened_subject, Control::OpenedSubject),
        (&s.opened_body, Control::OpenedBody),
    ];
    if let Some(list) = &s.inbox_list {
        pairs.push((list, Control::InboxList));
    }
    if let Some(marker) = &s.empty_inbox_marker {
        pairs.push((marker, Control::EmptyMarker));
    }
    if let Some(time) = &s.newest_timestamp {
        pairs.push((time, Control::NewestTime));
    }

    let mut map = HashMap::new();
    for (selector, control) in pairs {
        // first declaration wins when a profile reuses a locator
        map.entry(selector.clone()).or_insert(control);
    }

    let mut label_options = HashMap::new();
    for label in labels {
        for (template, control) in [
            (&s.label_option, Control::LabelOption),
            (&s.message_label_option, Control::MessageLabelOption),
        ] {
            let selector = template.with_label(label);
            if !map.contains_key(&selector) {
                map.insert(selector.clone(), control);
                label_options.insert(selector, label.clone());
            }
        }
    }
    (map, label_options)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Screen {
    #[default]
    Blank,
    Identifier,
    Password,
    Inbox,
    Message(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
enum Menu {
    #[default]
    Closed,
    MoreOptions,
    Labels,
}

#[derive(Debug, Default)]
struct Draft {
    to: String,
    subject: String,
    body: String,
    labels: Vec<String>,
    menu: Menu,
}

#[derive(Debug, Default)]
struct Page {
    screen: Screen,
    identifier: String,
    password: String,
    draft: Option<Draft>,
    message_menu: Menu,
    closed: bool,
}

/// One browser session against a [`SimMailClient`].
pub struct SimSession {
    shared: Arc<Shared>,
    controls: HashMap<Selector, Control>,
    label_options: HashMap<Selector, String>,
    login_url: String,
    checked_attribute: String,
    timestamp_attribute: String,
    page: Mutex<Page>,
}

impl SimSession {
    fn control_for(&self, selector: &Selector) -> DriverResult<Control> {
        self.controls
            .get(selector)
            .copied()
            .ok_or_else(|| DriverError::NotFound(selector.to_string()))
    }

    fn control_of(&self, element: &ElementHandle) -> DriverResult<Control> {
        let name = element.id().split('#').next().unwrap_or_default();
        self.controls
            .values()
            .copied()
            .find(|c| format!("{:?}", c) == name)
            .ok_or_else(|| DriverError::Stale(element.id().to_string()))
    }

    fn handle(&self, control: Control, selector: &Selector) -> ElementHandle {
        match self.label_options.get(selector) {
            Some(label) => ElementHandle::new(format!("{:?}#{}", control, label)),
            None => ElementHandle::new(format!("{:?}", control)),
        }
    }

    /// Label named by a label option handle.
    fn label_of(element: &ElementHandle) -> Option<&str> {
        element.id().split_once('#').map(|(_, label)| label)
    }

    fn is_present(control: Control, mail: &MailState, page: &Page) -> bool {
        if mail.missing.contains(&control) {
            return false;
        }
        let inbox = page.screen == Screen::Inbox;
        let has_mail = !mail.inbox.is_empty();
        let draft_menu = page.draft.as_ref().map(|d| d.menu);
        let message = matches!(page.screen, Screen::Message(_));

        match control {
            Control::Identifier | Control::IdentifierNext => page.screen == Screen::Identifier,
            Control::Password | Control::PasswordNext => page.screen == Screen::Password,
            Control::InboxReady | Control::InboxList => inbox,
            Control::Compose => inbox || message,
            Control::To | Control::Subject | Control::Body | Control::MoreOptions | Control::Send => {
                page.draft.is_some()
            }
            Control::LabelMenu => draft_menu >= Some(Menu::MoreOptions),
            Control::LabelOption => draft_menu == Some(Menu::Labels),
            Control::InboxRow => inbox && has_mail,
            Control::EmptyMarker => inbox && !has_mail,
            Control::NewestOriginator
            | Control::NewestSubject
            | Control::NewestTime
            | Control::NewestStar
            | Control::NewestOpen => inbox && has_mail,
            Control::MessageMoreOptions | Control::OpenedSubject | Control::OpenedBody => message,
            Control::MessageLabelMenu => message && page.message_menu >= Menu::MoreOptions,
            Control::MessageLabelOption => message && page.message_menu == Menu::Labels,
        }
    }

    /// Lock state, deliver due mail, and check the session and element are live.
    fn with_live<T>(
        &self,
        element: &ElementHandle,
        f: impl FnOnce(Control, &mut MailState, &mut Page) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let control = self.control_of(element)?;
        let mut mail = self.shared.mail.lock();
        let mut page = self.page.lock();
        if page.closed {
            return Err(DriverError::Session("session closed".into()));
        }
        mail.deliver_due();
        if !Self::is_present(control, &mail, &page) {
            return Err(DriverError::Stale(element.id().to_string()));
        }
        f(control, &mut *mail, &mut *page)
    }

    fn consume_fault(control: Control, mail: &mut MailState) -> DriverResult<()> {
        if let Some(remaining) = mail.flaky.get_mut(&control) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DriverError::NotInteractable(format!("{:?} is obscured", control)));
            }
        }
        Ok(())
    }

    fn activate(&self, control: Control, label: Option<&str>, mail: &mut MailState, page: &mut Page) {
        let options = &self.shared.options;
        match control {
            Control::IdentifierNext => {
                if !page.identifier.is_empty() {
                    page.screen = Screen::Password;
                }
            }
            Control::PasswordNext => {
                let accepted = options
                    .credential
                    .as_deref()
                    .map(|expected| expected == page.password)
                    .unwrap_or(true);
                if accepted {
                    page.screen = Screen::Inbox;
                }
            }
            Control::Compose => {
                mail.compose_opened += 1;
                page.draft = Some(Draft::default());
            }
            Control::MoreOptions => {
                if let Some(d) = page.draft.as_mut() {
                    d.menu = Menu::MoreOptions;
                }
            }
            Control::LabelMenu => {
                if let Some(d) = page.draft.as_mut() {
                    d.menu = Menu::Labels;
                }
            }
            Control::LabelOption => {
                if let (Some(d), Some(label)) = (page.draft.as_mut(), label) {
                    if !d.labels.iter().any(|l| l == label) {
                        d.labels.push(label.to_string());
                    }
                    d.menu = Menu::Closed;
                }
            }
            Control::Send => {
                if let Some(draft) = page.draft.take() {
                    mail.sends += 1;
                    debug!(to = %draft.to, subject = %draft.subject, "sim: sent");
                    if !options.drop_deliveries {
                        let body = options.body_override.clone().unwrap_or(draft.body);
                        let labels = if options.strip_labels { Vec::new() } else { draft.labels };
                        let stored = mail.allocate(&options.deliver_as, &draft.subject, &body, labels);
                        mail.pending.push((Instant::now() + options.delivery_delay, stored));
                    }
                }
            }
            Control::NewestStar => {
                if let Some(newest) = mail.inbox.first_mut() {
                    newest.starred = !newest.starred;
                }
            }
            Control::NewestOpen => {
                if let Some(newest) = mail.inbox.first() {
                    page.screen = Screen::Message(newest.id);
                    page.message_menu = Menu::Closed;
                }
            }
            Control::MessageMoreOptions => page.message_menu = Menu::MoreOptions,
            Control::MessageLabelMenu => page.message_menu = Menu::Labels,
            _ => {}
        }
    }

    fn opened<'m>(mail: &'m MailState, page: &Page) -> DriverResult<&'m StoredMail> {
        match page.screen {
            Screen::Message(id) => mail
                .inbox
                .iter()
                .find(|m| m.id == id)
                .ok_or_else(|| DriverError::Stale(format!("message {}", id))),
            _ => Err(DriverError::NotFound("no message open".into())),
        }
    }
}

#[async_trait]
impl Driver for SimSession {
    async fn navigate(&self, url: &str) -> DriverResult<()> {
        let mut page = self.page.lock();
        if page.closed {
            return Err(DriverError::Session("session closed".into()));
        }
        *page = Page::default();
        if url == self.login_url {
            page.screen = Screen::Identifier;
        }
        Ok(())
    }

    async fn locate(&self, selector: &Selector) -> DriverResult<ElementHandle> {
        let control = self.control_for(selector)?;
        let mut mail = self.shared.mail.lock();
        let page = self.page.lock();
        if page.closed {
            return Err(DriverError::Session("session closed".into()));
        }
        mail.deliver_due();
        if Self::is_present(control, &mail, &page) {
            Ok(self.handle(control, selector))
        } else {
            Err(DriverError::NotFound(selector.to_string()))
        }
    }

    async fn locate_all(&self, selector: &Selector) -> DriverResult<Vec<ElementHandle>> {
        let control = match self.control_for(selector) {
            Ok(c) => c,
            Err(_) => return Ok(Vec::new()),
        };
        let mut mail = self.shared.mail.lock();
        let page = self.page.lock();
        if page.closed {
            return Err(DriverError::Session("session closed".into()));
        }
        mail.deliver_due();
        if !Self::is_present(control, &mail, &page) {
            return Ok(Vec::new());
        }
        let handles = if control == Control::InboxRow {
            (0..mail.inbox.len())
                .map(|i| ElementHandle::new(format!("{:?}#{}", control, i)))
                .collect()
        } else {
            vec![self.handle(control, selector)]
        };
        Ok(handles)
    }

    async fn click(&self, element: &ElementHandle) -> DriverResult<()> {
        self.with_live(element, |control, mail, page| {
            Self::consume_fault(control, mail)?;
            self.activate(control, Self::label_of(element), mail, page);
            Ok(())
        })
    }

    async fn type_text(&self, element: &ElementHandle, text: &str) -> DriverResult<()> {
        self.with_live(element, |control, mail, page| {
            Self::consume_fault(control, mail)?;
            match control {
                Control::Identifier => page.identifier.push_str(text),
                Control::Password => page.password.push_str(text),
                Control::To | Control::Subject | Control::Body => {
                    if let Some(d) = page.draft.as_mut() {
                        let field = match control {
                            Control::To => &mut d.to,
                            Control::Subject => &mut d.subject,
                            _ => &mut d.body,
                        };
                        field.push_str(text);
                    }
                }
                other => {
                    return Err(DriverError::NotInteractable(format!("{:?} does not accept text", other)));
                }
            }
            Ok(())
        })
    }

    async fn read_text(&self, element: &ElementHandle) -> DriverResult<String> {
        let options = &self.shared.options;
        self.with_live(element, |control, mail, page| {
            let newest = mail.inbox.first();
            let text = match control {
                Control::EmptyMarker => options.empty_text.clone(),
                Control::NewestOriginator => newest.map(|m| m.originator.clone()).unwrap_or_default(),
                Control::NewestSubject => newest.map(|m| m.subject.clone()).unwrap_or_default(),
                Control::OpenedSubject => Self::opened(mail, page)?.subject.clone(),
                Control::OpenedBody => Self::opened(mail, page)?.body.clone(),
                _ => String::new(),
            };
            Ok(text)
        })
    }

    async fn read_attribute(&self, element: &ElementHandle, name: &str) -> DriverResult<Option<String>> {
        self.with_live(element, |control, mail, page| {
            let value = match control {
                Control::NewestTime if name == self.timestamp_attribute => {
                    mail.inbox.first().map(|m| m.timestamp.clone())
                }
                Control::MessageLabelOption if name == self.checked_attribute => {
                    let label = Self::label_of(element);
                    let applied = Self::opened(mail, page)?.labels.iter().any(|l| Some(l.as_str()) == label);
                    Some(applied.to_string())
                }
                _ => None,
            };
            Ok(value)
        })
    }

    async fn force_click(&self, element: &ElementHandle) -> DriverResult<()> {
        self.with_live(element, |control, mail, page| {
            self.activate(control, Self::label_of(element), mail, page);
            Ok(())
        })
    }

    async fn close_session(&self) -> DriverResult<()> {
        let mut mail = self.shared.mail.lock();
        let mut page = self.page.lock();
        if page.closed {
            return Err(DriverError::Session("session already closed".into()));
        }
        page.closed = true;
        mail.sessions_closed += 1;
        Ok(())
    }
}
