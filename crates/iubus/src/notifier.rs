//! Component presence announcements.
//!
//! A [`ComponentNotifier`] publishes a message on the `componentNotify`
//! category naming the component, its function and the categories it sends
//! and receives. On start it announces itself as `new`; every running
//! notifier that sees a `new` announcement answers with its own `old` one,
//! so late joiners learn about components that started before them. On
//! termination a final `down` announcement is sent.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use iubus_core::IuEventType;
use iubus_transport::Transport;

use crate::config::BufferConfig;
use crate::error::{IuError, Result};
use crate::input::InputBuffer;
use crate::iu::Iu;
use crate::output::OutputBuffer;

/// Category carrying component announcements.
pub const NOTIFY_CATEGORY: &str = "componentNotify";

pub const NAME_KEY: &str = "name";
pub const FUNCTION_KEY: &str = "function";
pub const SEND_CATEGORIES_KEY: &str = "send_categories";
pub const RECEIVE_CATEGORIES_KEY: &str = "recv_categories";
pub const STATE_KEY: &str = "state";

/// Lifecycle stage carried by an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationState {
    /// The component just started.
    New,
    /// The component was already running; sent in answer to `New`.
    Old,
    /// The component shut down.
    Down,
}

impl NotificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationState::New => "new",
            NotificationState::Old => "old",
            NotificationState::Down => "down",
        }
    }
}

impl fmt::Display for NotificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationState {
    type Err = IuError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(NotificationState::New),
            "old" => Ok(NotificationState::Old),
            "down" => Ok(NotificationState::Down),
            other => Err(IuError::TypeConversion {
                value: other.to_string(),
                target: "notification state",
            }),
        }
    }
}

/// One component announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentNotice {
    pub name: String,
    pub function: String,
    pub send_categories: BTreeSet<String>,
    pub receive_categories: BTreeSet<String>,
    pub state: NotificationState,
}

impl ComponentNotice {
    /// Build the message IU announcing this notice.
    pub fn to_message(&self) -> Iu {
        Iu::builder(NOTIFY_CATEGORY)
            .message()
            .item(NAME_KEY, self.name.as_str())
            .item(FUNCTION_KEY, self.function.as_str())
            .item(SEND_CATEGORIES_KEY, join(&self.send_categories))
            .item(RECEIVE_CATEGORIES_KEY, join(&self.receive_categories))
            .item(STATE_KEY, self.state.as_str())
            .build()
    }

    /// Read a notice back from a received announcement.
    pub fn from_iu(iu: &Iu) -> Result<Self> {
        let payload = iu.payload();
        Ok(Self {
            name: payload.get_str(NAME_KEY),
            function: payload.get_str(FUNCTION_KEY),
            send_categories: split(&payload.get_str(SEND_CATEGORIES_KEY)),
            receive_categories: split(&payload.get_str(RECEIVE_CATEGORIES_KEY)),
            state: payload.get_str(STATE_KEY).parse()?,
        })
    }
}

fn join(categories: &BTreeSet<String>) -> String {
    categories.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

fn split(categories: &str) -> BTreeSet<String> {
    categories
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Callback for announcements from other components.
pub type NotificationFn = dyn Fn(&ComponentNotice) -> anyhow::Result<()> + Send + Sync;

// ─────────────────────────────────────────────────────────────────────────────
// Notifier
// ─────────────────────────────────────────────────────────────────────────────

struct NotifierShared {
    name: String,
    function: String,
    send_categories: BTreeSet<String>,
    receive_categories: BTreeSet<String>,
    output: OutputBuffer,
    input: InputBuffer,
    handlers: Mutex<Vec<Arc<NotificationFn>>>,
    /// Serializes announcements with termination.
    submit: Mutex<()>,
    initialized: Mutex<bool>,
    terminated: AtomicBool,
}

impl NotifierShared {
    fn notice(&self, state: NotificationState) -> ComponentNotice {
        ComponentNotice {
            name: self.name.clone(),
            function: self.function.clone(),
            send_categories: self.send_categories.clone(),
            receive_categories: self.receive_categories.clone(),
            state,
        }
    }

    fn submit(&self, state: NotificationState) -> Result<()> {
        let _submit = self.submit.lock();
        if self.terminated.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.output.add(&self.notice(state).to_message())
    }

    fn handle_announcement(&self, iu: &Iu) -> anyhow::Result<()> {
        let notice = ComponentNotice::from_iu(iu)?;
        if notice.name == self.name {
            return Ok(());
        }
        tracing::debug!(component = %self.name, peer = %notice.name, state = %notice.state, "component announcement");

        let handlers: Vec<Arc<NotificationFn>> = self.handlers.lock().clone();
        for handler in handlers {
            if let Err(e) = handler(&notice) {
                tracing::error!(component = %self.name, peer = %notice.name, error = %e, "notification handler failed");
            }
        }

        if notice.state == NotificationState::New {
            self.submit(NotificationState::Old)?;
        }
        Ok(())
    }
}

/// Announces a component on the bus and reports the announcements of others.
///
/// Dropping an initialized notifier terminates it.
pub struct ComponentNotifier {
    shared: Arc<NotifierShared>,
}

impl ComponentNotifier {
    /// Create a notifier with its own buffers, named `<name>Notifier`, on the
    /// default channel.
    pub fn new<S, R>(
        name: impl Into<String>,
        function: impl Into<String>,
        send_categories: S,
        receive_categories: R,
        transport: Arc<dyn Transport>,
    ) -> Result<Self>
    where
        S: IntoIterator,
        S::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        let name = name.into();
        let basename = format!("{}Notifier", name);
        let output = OutputBuffer::new(BufferConfig::new(basename.clone()), Arc::clone(&transport))?;
        let input = InputBuffer::new(BufferConfig::new(basename), transport)?;
        Ok(Self::with_buffers(
            name,
            function,
            send_categories,
            receive_categories,
            output,
            input,
        ))
    }

    /// Create a notifier announcing through existing buffers.
    pub fn with_buffers<S, R>(
        name: impl Into<String>,
        function: impl Into<String>,
        send_categories: S,
        receive_categories: R,
        output: OutputBuffer,
        input: InputBuffer,
    ) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            shared: Arc::new(NotifierShared {
                name: name.into(),
                function: function.into(),
                send_categories: send_categories.into_iter().map(Into::into).collect(),
                receive_categories: receive_categories.into_iter().map(Into::into).collect(),
                output,
                input,
                handlers: Mutex::new(Vec::new()),
                submit: Mutex::new(()),
                initialized: Mutex::new(false),
                terminated: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn function(&self) -> &str {
        &self.shared.function
    }

    pub fn is_initialized(&self) -> bool {
        *self.shared.initialized.lock()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    /// Call `handler` for every announcement from another component.
    pub fn add_notification_handler<F>(&self, handler: F)
    where
        F: Fn(&ComponentNotice) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.handlers.lock().push(Arc::new(handler));
    }

    /// Start listening for announcements and announce this component as
    /// `new`. Calling it again is a no-op.
    pub fn initialize(&self) -> Result<()> {
        let mut initialized = self.shared.initialized.lock();
        if self.is_terminated() {
            return Err(IuError::ComponentTerminated(self.shared.name.clone()));
        }
        if *initialized {
            return Ok(());
        }

        let weak: Weak<NotifierShared> = Arc::downgrade(&self.shared);
        self.shared.input.register_handler(
            move |iu: &Iu, _: IuEventType, _: bool| match weak.upgrade() {
                Some(shared) => shared.handle_announcement(iu),
                None => Ok(()),
            },
            IuEventType::Message,
            &[NOTIFY_CATEGORY],
        )?;
        self.shared.submit(NotificationState::New)?;
        *initialized = true;
        tracing::info!(component = %self.shared.name, "component announced");
        Ok(())
    }

    /// Announce this component as `down`. Only the first call sends.
    pub fn terminate(&self) -> Result<()> {
        let _submit = self.shared.submit.lock();
        if self.shared.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared
            .output
            .add(&self.shared.notice(NotificationState::Down).to_message())
    }
}

impl Drop for ComponentNotifier {
    fn drop(&mut self) {
        if !self.is_initialized() {
            return;
        }
        if let Err(e) = self.terminate() {
            tracing::warn!(component = %self.shared.name, error = %e, "failed to announce termination");
        }
    }
}

impl fmt::Debug for ComponentNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentNotifier")
            .field("name", &self.shared.name)
            .field("function", &self.shared.function)
            .field("initialized", &self.is_initialized())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(state: NotificationState) -> ComponentNotice {
        ComponentNotice {
            name: "asr".to_string(),
            function: "recognizer".to_string(),
            send_categories: ["words".to_string(), "hypotheses".to_string()].into_iter().collect(),
            receive_categories: BTreeSet::new(),
            state,
        }
    }

    #[test]
    fn test_notice_message_layout() {
        let iu = notice(NotificationState::New).to_message();
        assert_eq!(iu.category(), NOTIFY_CATEGORY);
        assert!(iu.is_ephemeral());
        assert_eq!(iu.payload().get_str(NAME_KEY), "asr");
        assert_eq!(iu.payload().get_str(SEND_CATEGORIES_KEY), "hypotheses,words");
        assert_eq!(iu.payload().get_str(RECEIVE_CATEGORIES_KEY), "");
        assert_eq!(iu.payload().get_str(STATE_KEY), "new");
    }

    #[test]
    fn test_notice_read_back() {
        for state in [NotificationState::New, NotificationState::Old, NotificationState::Down] {
            let sent = notice(state);
            assert_eq!(ComponentNotice::from_iu(&sent.to_message()).unwrap(), sent);
        }
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        let iu = Iu::builder(NOTIFY_CATEGORY)
            .message()
            .item(NAME_KEY, "asr")
            .item(STATE_KEY, "sleeping")
            .build();
        assert!(matches!(
            ComponentNotice::from_iu(&iu),
            Err(IuError::TypeConversion { .. })
        ));
    }

    #[test]
    fn test_category_list_tolerates_blanks() {
        assert_eq!(
            split(" a, ,b,"),
            ["a".to_string(), "b".to_string()].into_iter().collect()
        );
    }
}
