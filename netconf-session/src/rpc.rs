//! Typed NETCONF RPC objects.
//!
//! An [`Rpc`] is a passive value: the caller builds it, [`send_rpc`]
//! serializes it into an `<rpc>` envelope, and the peer's reply is
//! correlated by message-id. Operation bodies follow RFC 6241; get-schema
//! and create-subscription carry their own namespaces.
//!
//! [`send_rpc`]: crate::session::Session::send_rpc

use netconf_wire::{XmlElement, NS_NOTIF};

/// Namespace of the with-defaults capability (RFC 6243).
pub const NS_WITH_DEFAULTS: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-with-defaults";

/// Namespace of NETCONF monitoring, home of `<get-schema>` (RFC 6022).
pub const NS_MONITORING: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring";

/// A configuration datastore reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datastore {
    /// The running datastore.
    Running,
    /// The candidate datastore.
    Candidate,
    /// The startup datastore.
    Startup,
    /// A URL-addressed config (`:url` capability).
    Url(String),
}

impl Datastore {
    fn to_element(&self) -> XmlElement {
        match self {
            Datastore::Running => XmlElement::new("running"),
            Datastore::Candidate => XmlElement::new("candidate"),
            Datastore::Startup => XmlElement::new("startup"),
            Datastore::Url(url) => XmlElement::new("url").with_text(url.clone()),
        }
    }

    fn wrapped(&self, wrapper: &str) -> XmlElement {
        XmlElement::new(wrapper).with_child(self.to_element())
    }
}

/// An operation filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Subtree filter content.
    Subtree(XmlElement),
    /// XPath expression (`:xpath` capability).
    XPath(String),
}

impl Filter {
    fn to_element(&self) -> XmlElement {
        match self {
            Filter::Subtree(content) => XmlElement::new("filter")
                .with_attr("type", "subtree")
                .with_child(content.clone()),
            Filter::XPath(select) => XmlElement::new("filter")
                .with_attr("type", "xpath")
                .with_attr("select", select.clone()),
        }
    }
}

/// with-defaults retrieval modes (RFC 6243).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithDefaults {
    /// Report all nodes.
    ReportAll,
    /// Report all nodes, tagging defaults.
    ReportAllTagged,
    /// Trim default-valued nodes.
    Trim,
    /// Report explicitly set nodes only.
    Explicit,
}

impl WithDefaults {
    /// Keyword as it appears on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            WithDefaults::ReportAll => "report-all",
            WithDefaults::ReportAllTagged => "report-all-tagged",
            WithDefaults::Trim => "trim",
            WithDefaults::Explicit => "explicit",
        }
    }

    fn to_element(self) -> XmlElement {
        XmlElement::new("with-defaults")
            .with_ns(NS_WITH_DEFAULTS)
            .with_text(self.as_str())
    }
}

/// `<default-operation>` of edit-config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultOperation {
    /// Merge (the protocol default).
    Merge,
    /// Replace.
    Replace,
    /// Do not apply absent-operation data.
    None,
}

impl DefaultOperation {
    fn as_str(self) -> &'static str {
        match self {
            DefaultOperation::Merge => "merge",
            DefaultOperation::Replace => "replace",
            DefaultOperation::None => "none",
        }
    }
}

/// `<test-option>` of edit-config (`:validate` capability).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOption {
    /// Validate, then apply.
    TestThenSet,
    /// Apply without validation.
    Set,
    /// Validate only.
    TestOnly,
}

impl TestOption {
    fn as_str(self) -> &'static str {
        match self {
            TestOption::TestThenSet => "test-then-set",
            TestOption::Set => "set",
            TestOption::TestOnly => "test-only",
        }
    }
}

/// `<error-option>` of edit-config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOption {
    /// Abort on first error.
    StopOnError,
    /// Continue past errors.
    ContinueOnError,
    /// Roll back on error (`:rollback-on-error` capability).
    RollbackOnError,
}

impl ErrorOption {
    fn as_str(self) -> &'static str {
        match self {
            ErrorOption::StopOnError => "stop-on-error",
            ErrorOption::ContinueOnError => "continue-on-error",
            ErrorOption::RollbackOnError => "rollback-on-error",
        }
    }
}

/// Edit content of `<edit-config>`: inline config or a url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditContent {
    /// Inline `<config>` content.
    Config(XmlElement),
    /// A URL-addressed config (`:url` capability).
    Url(String),
}

/// Source of a copy or validate: inline config or a datastore/url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Inline `<config>` content.
    Config(XmlElement),
    /// Another datastore (or url).
    Datastore(Datastore),
}

impl ConfigSource {
    fn to_element(&self, wrapper: &str) -> XmlElement {
        match self {
            ConfigSource::Config(content) => XmlElement::new(wrapper)
                .with_child(XmlElement::new("config").with_child(content.clone())),
            ConfigSource::Datastore(ds) => ds.wrapped(wrapper),
        }
    }
}

/// A typed NETCONF request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rpc {
    /// Caller-supplied operation element, sent as-is.
    Generic(XmlElement),
    /// `<get-config>`.
    GetConfig {
        /// Source datastore.
        source: Datastore,
        /// Optional filter.
        filter: Option<Filter>,
        /// Optional with-defaults mode.
        with_defaults: Option<WithDefaults>,
    },
    /// `<edit-config>`.
    EditConfig {
        /// Target datastore.
        target: Datastore,
        /// Edit content.
        config: EditContent,
        /// Optional `<default-operation>`.
        default_operation: Option<DefaultOperation>,
        /// Optional `<test-option>`.
        test_option: Option<TestOption>,
        /// Optional `<error-option>`.
        error_option: Option<ErrorOption>,
    },
    /// `<copy-config>`.
    CopyConfig {
        /// Target datastore.
        target: Datastore,
        /// Source datastore or inline config.
        source: ConfigSource,
    },
    /// `<delete-config>`.
    DeleteConfig {
        /// Target datastore (never `running`).
        target: Datastore,
    },
    /// `<lock>`.
    Lock {
        /// Target datastore.
        target: Datastore,
    },
    /// `<unlock>`.
    Unlock {
        /// Target datastore.
        target: Datastore,
    },
    /// `<get>`.
    Get {
        /// Optional filter.
        filter: Option<Filter>,
        /// Optional with-defaults mode.
        with_defaults: Option<WithDefaults>,
    },
    /// `<kill-session>`.
    KillSession {
        /// Victim session id.
        session_id: u32,
    },
    /// `<commit>` (`:candidate` capability).
    Commit {
        /// Confirmed commit.
        confirmed: bool,
        /// `<confirm-timeout>` seconds.
        confirm_timeout: Option<u32>,
        /// `<persist>` token.
        persist: Option<String>,
        /// `<persist-id>` of an earlier confirmed commit.
        persist_id: Option<String>,
    },
    /// `<discard-changes>`.
    DiscardChanges,
    /// `<cancel-commit>` (`:confirmed-commit:1.1`).
    CancelCommit {
        /// `<persist-id>` of the commit to cancel.
        persist_id: Option<String>,
    },
    /// `<validate>` (`:validate` capability).
    Validate {
        /// Source to validate.
        source: ConfigSource,
    },
    /// `<get-schema>` (RFC 6022).
    GetSchema {
        /// Schema identifier.
        identifier: String,
        /// Optional schema version.
        version: Option<String>,
        /// Optional schema format (e.g. `yang`).
        format: Option<String>,
    },
    /// `<create-subscription>` (RFC 5277).
    CreateSubscription {
        /// Event stream name.
        stream: Option<String>,
        /// Optional filter.
        filter: Option<Filter>,
        /// Replay start time.
        start_time: Option<String>,
        /// Replay stop time.
        stop_time: Option<String>,
    },
    /// `<close-session>`.
    CloseSession,
}

impl Rpc {
    /// Render the operation body placed inside the `<rpc>` envelope.
    pub fn to_body(&self) -> XmlElement {
        match self {
            Rpc::Generic(content) => content.clone(),
            Rpc::GetConfig {
                source,
                filter,
                with_defaults,
            } => {
                let mut op = XmlElement::new("get-config").with_child(source.wrapped("source"));
                if let Some(f) = filter {
                    op.children.push(f.to_element());
                }
                if let Some(wd) = with_defaults {
                    op.children.push(wd.to_element());
                }
                op
            }
            Rpc::EditConfig {
                target,
                config,
                default_operation,
                test_option,
                error_option,
            } => {
                let mut op = XmlElement::new("edit-config").with_child(target.wrapped("target"));
                if let Some(d) = default_operation {
                    op.children
                        .push(XmlElement::new("default-operation").with_text(d.as_str()));
                }
                if let Some(t) = test_option {
                    op.children
                        .push(XmlElement::new("test-option").with_text(t.as_str()));
                }
                if let Some(e) = error_option {
                    op.children
                        .push(XmlElement::new("error-option").with_text(e.as_str()));
                }
                match config {
                    EditContent::Config(content) => op
                        .children
                        .push(XmlElement::new("config").with_child(content.clone())),
                    EditContent::Url(url) => op
                        .children
                        .push(XmlElement::new("url").with_text(url.clone())),
                }
                op
            }
            Rpc::CopyConfig { target, source } => XmlElement::new("copy-config")
                .with_child(target.wrapped("target"))
                .with_child(source.to_element("source")),
            Rpc::DeleteConfig { target } => {
                XmlElement::new("delete-config").with_child(target.wrapped("target"))
            }
            Rpc::Lock { target } => XmlElement::new("lock").with_child(target.wrapped("target")),
            Rpc::Unlock { target } => {
                XmlElement::new("unlock").with_child(target.wrapped("target"))
            }
            Rpc::Get {
                filter,
                with_defaults,
            } => {
                let mut op = XmlElement::new("get");
                if let Some(f) = filter {
                    op.children.push(f.to_element());
                }
                if let Some(wd) = with_defaults {
                    op.children.push(wd.to_element());
                }
                op
            }
            Rpc::KillSession { session_id } => XmlElement::new("kill-session")
                .with_child(XmlElement::new("session-id").with_text(session_id.to_string())),
            Rpc::Commit {
                confirmed,
                confirm_timeout,
                persist,
                persist_id,
            } => {
                let mut op = XmlElement::new("commit");
                if *confirmed {
                    op.children.push(XmlElement::new("confirmed"));
                    if let Some(t) = confirm_timeout {
                        op.children
                            .push(XmlElement::new("confirm-timeout").with_text(t.to_string()));
                    }
                    if let Some(p) = persist {
                        op.children
                            .push(XmlElement::new("persist").with_text(p.clone()));
                    }
                }
                if let Some(p) = persist_id {
                    op.children
                        .push(XmlElement::new("persist-id").with_text(p.clone()));
                }
                op
            }
            Rpc::DiscardChanges => XmlElement::new("discard-changes"),
            Rpc::CancelCommit { persist_id } => {
                let mut op = XmlElement::new("cancel-commit");
                if let Some(p) = persist_id {
                    op.children
                        .push(XmlElement::new("persist-id").with_text(p.clone()));
                }
                op
            }
            Rpc::Validate { source } => {
                XmlElement::new("validate").with_child(source.to_element("source"))
            }
            Rpc::GetSchema {
                identifier,
                version,
                format,
            } => {
                let mut op = XmlElement::new("get-schema")
                    .with_ns(NS_MONITORING)
                    .with_child(XmlElement::new("identifier").with_text(identifier.clone()));
                if let Some(v) = version {
                    op.children
                        .push(XmlElement::new("version").with_text(v.clone()));
                }
                if let Some(f) = format {
                    op.children
                        .push(XmlElement::new("format").with_text(f.clone()));
                }
                op
            }
            Rpc::CreateSubscription {
                stream,
                filter,
                start_time,
                stop_time,
            } => {
                let mut op = XmlElement::new("create-subscription").with_ns(NS_NOTIF);
                if let Some(s) = stream {
                    op.children
                        .push(XmlElement::new("stream").with_text(s.clone()));
                }
                if let Some(f) = filter {
                    op.children.push(f.to_element());
                }
                if let Some(t) = start_time {
                    op.children
                        .push(XmlElement::new("startTime").with_text(t.clone()));
                }
                if let Some(t) = stop_time {
                    op.children
                        .push(XmlElement::new("stopTime").with_text(t.clone()));
                }
                op
            }
            Rpc::CloseSession => XmlElement::new("close-session"),
        }
    }

    /// The operation element name, as it appears in the rpc body.
    pub fn operation_name(&self) -> &str {
        match self {
            Rpc::Generic(content) => &content.name,
            Rpc::GetConfig { .. } => "get-config",
            Rpc::EditConfig { .. } => "edit-config",
            Rpc::CopyConfig { .. } => "copy-config",
            Rpc::DeleteConfig { .. } => "delete-config",
            Rpc::Lock { .. } => "lock",
            Rpc::Unlock { .. } => "unlock",
            Rpc::Get { .. } => "get",
            Rpc::KillSession { .. } => "kill-session",
            Rpc::Commit { .. } => "commit",
            Rpc::DiscardChanges => "discard-changes",
            Rpc::CancelCommit { .. } => "cancel-commit",
            Rpc::Validate { .. } => "validate",
            Rpc::GetSchema { .. } => "get-schema",
            Rpc::CreateSubscription { .. } => "create-subscription",
            Rpc::CloseSession => "close-session",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_body() {
        let rpc = Rpc::Lock {
            target: Datastore::Running,
        };
        assert_eq!(
            rpc.to_body().to_xml(),
            "<lock><target><running/></target></lock>"
        );
    }

    #[test]
    fn test_get_config_with_filter_and_defaults() {
        let rpc = Rpc::GetConfig {
            source: Datastore::Candidate,
            filter: Some(Filter::XPath("/interfaces/interface".to_string())),
            with_defaults: Some(WithDefaults::Trim),
        };
        let xml = rpc.to_body().to_xml();
        assert!(xml.starts_with("<get-config><source><candidate/></source>"));
        assert!(xml.contains("<filter type=\"xpath\" select=\"/interfaces/interface\"/>"));
        assert!(xml.contains(">trim</with-defaults>"));
    }

    #[test]
    fn test_edit_config_options() {
        let rpc = Rpc::EditConfig {
            target: Datastore::Candidate,
            config: EditContent::Config(XmlElement::new("top")),
            default_operation: Some(DefaultOperation::Replace),
            test_option: Some(TestOption::TestThenSet),
            error_option: Some(ErrorOption::RollbackOnError),
        };
        let xml = rpc.to_body().to_xml();
        assert!(xml.contains("<default-operation>replace</default-operation>"));
        assert!(xml.contains("<test-option>test-then-set</test-option>"));
        assert!(xml.contains("<error-option>rollback-on-error</error-option>"));
        assert!(xml.contains("<config><top/></config>"));
    }

    #[test]
    fn test_kill_session_body() {
        let rpc = Rpc::KillSession { session_id: 4 };
        assert_eq!(
            rpc.to_body().to_xml(),
            "<kill-session><session-id>4</session-id></kill-session>"
        );
    }

    #[test]
    fn test_confirmed_commit() {
        let rpc = Rpc::Commit {
            confirmed: true,
            confirm_timeout: Some(300),
            persist: Some("abc".to_string()),
            persist_id: None,
        };
        let xml = rpc.to_body().to_xml();
        assert!(xml.contains("<confirmed/>"));
        assert!(xml.contains("<confirm-timeout>300</confirm-timeout>"));
        assert!(xml.contains("<persist>abc</persist>"));
    }

    #[test]
    fn test_get_schema_carries_monitoring_namespace() {
        let rpc = Rpc::GetSchema {
            identifier: "ietf-interfaces".to_string(),
            version: Some("2018-02-20".to_string()),
            format: Some("yang".to_string()),
        };
        let xml = rpc.to_body().to_xml();
        assert!(xml.contains(NS_MONITORING));
        assert!(xml.contains("<identifier>ietf-interfaces</identifier>"));
    }

    #[test]
    fn test_create_subscription_namespace() {
        let rpc = Rpc::CreateSubscription {
            stream: Some("NETCONF".to_string()),
            filter: None,
            start_time: None,
            stop_time: None,
        };
        let xml = rpc.to_body().to_xml();
        assert!(xml.contains(NS_NOTIF));
        assert!(xml.contains("<stream>NETCONF</stream>"));
    }
}
