//! Cross-enclave channel — lock-free single-slot mailbox on a connector region

pub mod mailbox;

pub use mailbox::{pair, MailboxReceiver, MailboxSender, Sent, SharedBuffer, MAILBOX_HEADER_LEN};
