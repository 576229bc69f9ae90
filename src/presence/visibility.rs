/// Whether the reader can actually see the conversation.
///
/// An embedding host may report visibility explicitly; when it does, that
/// signal wins. Otherwise the document counts as visible when it is shown
/// or focused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityGate {
    host: Option<bool>,
    document_visible: bool,
    document_focused: bool,
}

impl Default for VisibilityGate {
    fn default() -> Self {
        Self { host: None, document_visible: true, document_focused: false }
    }
}

impl VisibilityGate {
    pub fn is_visible(&self) -> bool {
        self.host.unwrap_or(self.document_visible || self.document_focused)
    }

    /// Each setter returns `true` when the change made the reader able to see
    /// the conversation, which is the moment receipts need a fresh look.
    pub fn set_host(&mut self, visible: Option<bool>) -> bool {
        self.update(|gate| gate.host = visible)
    }

    pub fn set_document_visible(&mut self, visible: bool) -> bool {
        self.update(|gate| gate.document_visible = visible)
    }

    pub fn set_document_focused(&mut self, focused: bool) -> bool {
        self.update(|gate| gate.document_focused = focused)
    }

    fn update(&mut self, change: impl FnOnce(&mut Self)) -> bool {
        let before = self.is_visible();
        change(self);
        !before && self.is_visible()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_signal_overrides_document_state() {
        let mut gate = VisibilityGate::default();
        assert!(gate.is_visible());

        gate.set_host(Some(false));
        assert!(!gate.is_visible());
        gate.set_document_focused(true);
        assert!(!gate.is_visible());

        assert!(gate.set_host(None));
        assert!(gate.is_visible());
    }

    #[test]
    fn focus_alone_keeps_the_document_visible() {
        let mut gate = VisibilityGate::default();
        assert!(!gate.set_document_visible(false));
        assert!(!gate.is_visible());
        assert!(gate.set_document_focused(true));
        assert!(!gate.set_document_visible(true));
    }
}
