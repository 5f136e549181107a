#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Transforms of the active version; no arguments.
pub(crate) const TRANSFORM_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "bg",
        action: "remove_background",
    },
    CommandSpec {
        command: "upscale",
        action: "upscale",
    },
    CommandSpec {
        command: "face",
        action: "face_detail",
    },
    CommandSpec {
        command: "rotate",
        action: "rotate",
    },
    CommandSpec {
        command: "flip",
        action: "flip",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "undo",
        action: "undo",
    },
    CommandSpec {
        command: "redo",
        action: "redo",
    },
    CommandSpec {
        command: "versions",
        action: "list_versions",
    },
    CommandSpec {
        command: "auto",
        action: "reset_prompt",
    },
    CommandSpec {
        command: "video",
        action: "generate_video",
    },
    CommandSpec {
        command: "save",
        action: "save_history",
    },
    CommandSpec {
        command: "reset",
        action: "reset",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

/// Commands whose argument is kept verbatim.
pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "prompt",
        action: "set_prompt",
    },
    CommandSpec {
        command: "aspect",
        action: "set_aspect",
    },
    CommandSpec {
        command: "load",
        action: "load_image",
    },
    CommandSpec {
        command: "open",
        action: "load_history",
    },
];

pub const EDIT_HELP_COMMANDS: &[&str] = &[
    "/load",
    "/bg",
    "/upscale",
    "/face",
    "/rotate",
    "/flip",
    "/crop",
    "/aspect",
    "/undo",
    "/redo",
    "/use",
    "/compare",
    "/versions",
    "/set",
    "/prompt",
    "/auto",
    "/generate",
    "/video",
    "/save",
    "/open",
    "/reset",
    "/help",
    "/quit",
];
