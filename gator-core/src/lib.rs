mod client;
mod oauth;

pub use client::{
    ApiErrorClass, Change, ChangeList, Channel, DriveClient, DriveError, DriveFile, FileList,
    Capabilities, ShortcutDetails, User, FOLDER_MIME_TYPE, SHORTCUT_MIME_TYPE,
};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};
