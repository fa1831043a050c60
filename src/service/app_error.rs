// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
#[error("Transport error")]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// marker error, the read buffer does not yet hold a full frame
    Incomplete,

    /// signal protocol errors
    #[error("malformed frame: {0}")]
    FormatError(String),

    #[error("malformed signal: {0}")]
    ProtocolError(String),

    #[error("frame too large: {0}")]
    FrameTooLarge(String),

    /// local precondition failures
    #[error("no live transport for this peer")]
    NotConnected,

    #[error("a connect attempt is already in flight")]
    AlreadyConnecting,

    #[error("unknown session: {0}")]
    UnknownSession(u64),
}
