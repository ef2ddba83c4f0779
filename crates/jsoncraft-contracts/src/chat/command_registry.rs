#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    pub arg_key: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "template",
        action: "set_template",
        arg_key: "name",
    },
    CommandSpec {
        command: "model",
        action: "set_model",
        arg_key: "model",
    },
    CommandSpec {
        command: "session",
        action: "switch_session",
        arg_key: "id",
    },
    CommandSpec {
        command: "delete",
        action: "delete_session",
        arg_key: "id",
    },
    CommandSpec {
        command: "retry",
        action: "retry_message",
        arg_key: "id",
    },
    CommandSpec {
        command: "gallery",
        action: "search_gallery",
        arg_key: "query",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "attach",
        action: "attach_image",
        arg_key: "path",
    },
    CommandSpec {
        command: "export",
        action: "export_data",
        arg_key: "path",
    },
    CommandSpec {
        command: "import",
        action: "import_data",
        arg_key: "path",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
        arg_key: "",
    },
    CommandSpec {
        command: "templates",
        action: "list_templates",
        arg_key: "",
    },
    CommandSpec {
        command: "sessions",
        action: "list_sessions",
        arg_key: "",
    },
    CommandSpec {
        command: "new",
        action: "start_session",
        arg_key: "",
    },
    CommandSpec {
        command: "clear",
        action: "clear_chat",
        arg_key: "",
    },
    CommandSpec {
        command: "stop",
        action: "stop_assistant",
        arg_key: "",
    },
    CommandSpec {
        command: "detach",
        action: "detach_image",
        arg_key: "",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
        arg_key: "",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/help",
    "/attach <path>",
    "/detach",
    "/template <name|none>",
    "/templates",
    "/retry [message-id]",
    "/gallery [query]",
    "/new",
    "/sessions",
    "/session <id>",
    "/delete <id>",
    "/clear",
    "/stop",
    "/export <path>",
    "/import <path>",
    "/model <name>",
    "/quit",
];
