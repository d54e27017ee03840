/// Every message the engine can show the user, either as a notification or a
/// yes/no prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// Release metadata could not be fetched from any source.
    ReleaseUnavailable,
    /// The content host could not be reached and no cached copy exists.
    WebAppUnreachable,
    /// The hash companion host could not be reached.
    ApiUnreachable,
    /// The per-file listing could not be fetched.
    FileListUnavailable,
    /// A downloaded artifact failed hash or signature verification.
    HashMismatch,
    /// Verified files could not be written to the local cache.
    InstallFailed,
    /// The release needs a newer host application.
    ClientOutdated,
    /// Prompt: a newer release is available.
    UpdateAvailable,
    /// Prompt: fall back to the previously verified cache.
    KeepCached,
    /// Prompt: cached files no longer verify.
    CachedCopyUnverified,
}

const CHECK_FAILURE: &str = "Scatter Embed Check Failure";

impl Notice {
    /// Heading shown above the message.
    pub fn title(self) -> &'static str {
        match self {
            Notice::ReleaseUnavailable => "Could not get release information.",
            Notice::ClientOutdated => "Scatter needs to be updated.",
            Notice::UpdateAvailable => "An updated Scatter Embed is available.",
            Notice::KeepCached => "There was an issue getting the latest Embed version.",
            Notice::CachedCopyUnverified => "Your local Scatter Embed could not be verified.",
            Notice::WebAppUnreachable
            | Notice::ApiUnreachable
            | Notice::FileListUnavailable
            | Notice::HashMismatch
            | Notice::InstallFailed => CHECK_FAILURE,
        }
    }

    /// Body text shown to the user.
    pub fn message(self) -> &'static str {
        match self {
            Notice::ReleaseUnavailable => {
                "There was an issue getting the latest release information from our API or \
                 GitHub. Please try again later."
            }
            Notice::WebAppUnreachable => {
                "Your desktop client could not make a connection with our web wallet embed, so it \
                 can't verify that it is safe to use. If you are in a country which restricts IPs \
                 such as China or Russia, you may need to enable a proxy."
            }
            Notice::ApiUnreachable => {
                "Scatter failed to make a connection with our API which is used to verify the hash \
                 of the web wallet embed. If you are in a country which restricts IPs such as \
                 China or Russia, you may need to enable a proxy."
            }
            Notice::FileListUnavailable => {
                "Scatter failed to get a list of files available for the latest embedded version."
            }
            Notice::HashMismatch => {
                "The hash created from the web wallet embed does not match the hash returned from \
                 our secure API. This could be due to an update happening right now. Please try \
                 again in a moment. If this problem persists please contact support immediately."
            }
            Notice::InstallFailed => {
                "Scatter verified the latest web wallet embed but could not save it to your \
                 computer. Please check that there is enough free disk space and that Scatter \
                 can write to its data folder, then try again."
            }
            Notice::ClientOutdated => {
                "The latest Scatter Embed requires a newer version of this desktop client. Please \
                 download the latest release of Scatter to keep using it."
            }
            Notice::UpdateAvailable => {
                "There is an updated version of Scatter Embed available. Do you want to use it?"
            }
            Notice::KeepCached => {
                "Would you like to keep using your locally cached version of Scatter Embed which \
                 has already been verified previously?"
            }
            Notice::CachedCopyUnverified => {
                "Some of your locally cached Scatter Embed files do not match their signed \
                 hashes. Do you want to download a fresh, verified copy? Choosing no keeps the \
                 local copy as it is."
            }
        }
    }
}
