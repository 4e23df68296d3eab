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

use crate::rpc::Shape;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// rpc errors
    #[error("function id {0}: function already registered")]
    DuplicateFunction(String),

    #[error("function id {0}: function not registered")]
    UnknownFunction(String),

    #[error("function id {id}: return type mismatch, expected {expected}, registered {actual}")]
    ShapeMismatch {
        id: String,
        expected: Shape,
        actual: Shape,
    },

    #[error("rpc request queue full")]
    QueueFull,

    #[error("too many pending async calls")]
    TooManyPendingCalls,

    #[error("rpc server closed")]
    ServerClosed,

    #[error("call panicked: {0}")]
    CallPanicked(String),

    #[error("call failed: {0}")]
    CallFailed(String),

    /// framing errors
    #[error("message too short: {len} < {min}")]
    FrameTooShort { len: usize, min: usize },

    #[error("message too long: {len} > {max}")]
    FrameTooLong { len: usize, max: usize },

    /// connection errors
    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection {0} write queue full")]
    WriteQueueFull(u64),
}

impl AppError {
    /// Capacity errors are recoverable and never block the caller.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            AppError::QueueFull | AppError::TooManyPendingCalls | AppError::WriteQueueFull(_)
        )
    }
}
