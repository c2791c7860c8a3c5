//! Server cursors driven through `sp_cursoropen`, `sp_cursorfetch`,
//! `sp_cursor` and `sp_cursorclose`

mod client;
mod state;

pub use client::{
    CallReply, CursorClient, OpenedCursor, RpcCall, close_params, declarations, exec_text,
    execute_sql_params, fetch_params, modify_params, open_params,
};
pub use state::{CursorProtocol, CursorState, FetchOutcome};
