// SPDX-License-Identifier: Apache-2.0

use clap::Args;

use super::file_receiver::FileReceiverArgs;

#[derive(Debug, Args, Clone)]
pub struct StartArgs {
    #[command(flatten)]
    pub file_receiver: FileReceiverArgs,
}
