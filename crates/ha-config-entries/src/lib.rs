//! Config entries and config flows
//!
//! A config entry is one configured instance of an integration. The
//! [`ConfigEntries`] manager persists entries in `.storage/core.config_entries`
//! and moves them through their lifecycle (setup, retry, unload, reload,
//! removal). Entries are created by [`ConfigFlow`]s, small step-by-step
//! dialogs that validate user input before anything is stored.

pub mod entry;
pub mod flow;
mod flow_manager;
pub mod handler;
pub mod manager;
pub mod state_machine;

pub use entry::{
    ConfigEntry, ConfigEntryDisabledBy, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate,
    EntryData,
};
pub use flow::{
    validate_input, ConfigFlow, FieldType, FlowContext, FlowError, FlowFactory, FlowProgress,
    FlowResult, FlowResultType, FormErrorKey, FormField, ABORT_ALREADY_CONFIGURED,
    ABORT_ALREADY_IN_PROGRESS, ABORT_REAUTH_SUCCESSFUL, ABORT_SINGLE_INSTANCE,
};
pub use handler::{EntryHandler, MigrationError, SetupError};
pub use manager::{
    ConfigEntries, ConfigEntriesData, ConfigEntriesError, ConfigEntriesResult, UnloadCallback,
    STORAGE_KEY, STORAGE_VERSION,
};
pub use state_machine::{calculate_retry_delay, InvalidTransition};
