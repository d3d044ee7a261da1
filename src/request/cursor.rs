use super::NodeId;

/// Active writer of a connection.
///
/// Exactly one request may reach the connection at a time. The cursor only moves through
/// [`Cursor::step`].
#[derive(Debug)]
pub(crate) struct Cursor {
    active: NodeId,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Transition {
    /// A subrequest takes over the connection.
    Activate(NodeId),
    /// A finished subrequest hands the connection back to its parent.
    Return { from: NodeId, to: NodeId },
}

impl Cursor {
    #[inline]
    pub(crate) const fn new(main: NodeId) -> Self {
        Self { active: main }
    }

    #[inline]
    pub(crate) const fn active(&self) -> NodeId {
        self.active
    }

    #[inline]
    pub(crate) fn is(&self, id: NodeId) -> bool {
        self.active == id
    }

    pub(crate) fn step(&mut self, transition: Transition) -> NodeId {
        match transition {
            Transition::Activate(id) => self.active = id,
            Transition::Return { from, to } => {
                debug_assert_eq!(self.active, from, "inactive request returned the connection");
                self.active = to;
            }
        }
        self.active
    }
}
