use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    SinkExt, Stream,
    channel::mpsc,
    stream::FusedStream,
};
use ironposh_pool_core::{ErrorItem, PoolError, PsItem, PsValue};

/// One item read from a running pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineData {
    Output(PsValue),
    Error(ErrorItem),
}

impl PipelineData {
    pub fn is_error(&self) -> bool {
        matches!(self, PipelineData::Error(_))
    }
}

impl From<PipelineData> for PsItem {
    fn from(data: PipelineData) -> Self {
        match data {
            PipelineData::Output(value) => PsItem::Value(value),
            PipelineData::Error(item) => PsItem::Error(item.into()),
        }
    }
}

/// Sender side of a pipeline's input.
pub type PipelineInputWriter = mpsc::Sender<PsValue>;

/// Creates the data channel of one pipeline execution.
///
/// Output and error items share a single bounded queue, so the reader sees
/// them in the order the executor wrote them. A full queue makes the writer
/// wait.
pub fn pipeline_channel(capacity: usize) -> (PipelineWriter, PipelineReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (PipelineWriter { tx }, PipelineReader { rx })
}

#[derive(Debug, Clone)]
pub struct PipelineWriter {
    tx: mpsc::Sender<PipelineData>,
}

impl PipelineWriter {
    pub async fn write_output(&mut self, value: impl Into<PsValue>) -> Result<(), PoolError> {
        self.write(PipelineData::Output(value.into())).await
    }

    pub async fn write_error(&mut self, item: impl Into<ErrorItem>) -> Result<(), PoolError> {
        self.write(PipelineData::Error(item.into())).await
    }

    pub async fn write(&mut self, data: PipelineData) -> Result<(), PoolError> {
        self.tx
            .send(data)
            .await
            .map_err(|_| PoolError::InvalidState("pipeline reader dropped"))
    }

    /// Non-waiting write for push-style callbacks. Fails when the queue is full.
    pub fn try_write(&mut self, data: PipelineData) -> Result<(), PoolError> {
        self.tx.try_send(data).map_err(|e| {
            if e.is_full() {
                PoolError::InvalidState("pipeline channel full")
            } else {
                PoolError::InvalidState("pipeline reader dropped")
            }
        })
    }

    /// Marks the end of the pipeline's data for every writer clone.
    pub fn close(&mut self) {
        self.tx.close_channel();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct PipelineReader {
    rx: mpsc::Receiver<PipelineData>,
}

impl Stream for PipelineReader {
    type Item = PipelineData;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl FusedStream for PipelineReader {
    fn is_terminated(&self) -> bool {
        self.rx.is_terminated()
    }
}
