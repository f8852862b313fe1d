//! Live plotting collaborator interface.
//!
//! The station streams every persisted row to a [`LivePlotter`] as it is
//! acquired. Rendering itself is out of scope here; implementations
//! forward rows to whatever draws them. [`BroadcastPlotter`] fans rows out
//! over a tokio broadcast channel for an external renderer to consume,
//! and [`NullPlotter`] discards everything for headless runs.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Streaming visualization collaborator.
///
/// Rows arrive strictly after they were handed to persistence, in the
/// same order. `add_row_new_line` starts a new rendered series; 2-D
/// sweeps use it at each fast-axis restart so the data draws as a stack
/// of 1-D traces.
#[async_trait]
pub trait LivePlotter: Send + Sync {
    /// Declare the column schema for the upcoming run.
    async fn set_columns(&mut self, columns: &[String]) -> Result<()>;

    /// Append a row to the current series.
    async fn add_row(&mut self, row: &[f64]) -> Result<()>;

    /// Append a row, starting a new rendered series.
    async fn add_row_new_line(&mut self, row: &[f64]) -> Result<()>;

    /// Render a final snapshot image, if the backend can produce one.
    /// Called once during run finalization; the bytes are attached to the
    /// run as `plot.png`.
    async fn render_snapshot(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Plotter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlotter;

#[async_trait]
impl LivePlotter for NullPlotter {
    async fn set_columns(&mut self, _columns: &[String]) -> Result<()> {
        Ok(())
    }

    async fn add_row(&mut self, _row: &[f64]) -> Result<()> {
        Ok(())
    }

    async fn add_row_new_line(&mut self, _row: &[f64]) -> Result<()> {
        Ok(())
    }

    async fn render_snapshot(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// One event on a [`BroadcastPlotter`] stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PlotEvent {
    /// Column schema for the run that just started.
    Columns(Vec<String>),
    /// One acquired row.
    Row {
        /// Values in schema order.
        values: Vec<f64>,
        /// Whether this row starts a new rendered series.
        new_line: bool,
    },
}

/// Plotter that fans rows out over a broadcast channel.
///
/// A renderer (GUI panel, notebook cell, logging sink) subscribes and
/// receives events in acquisition order. With no subscribers attached,
/// events are dropped silently, so a station can keep one installed for
/// headless runs too.
pub struct BroadcastPlotter {
    tx: broadcast::Sender<PlotEvent>,
}

impl BroadcastPlotter {
    /// Create a plotter buffering up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<PlotEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: PlotEvent) {
        // A send error just means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl LivePlotter for BroadcastPlotter {
    async fn set_columns(&mut self, columns: &[String]) -> Result<()> {
        self.send(PlotEvent::Columns(columns.to_vec()));
        Ok(())
    }

    async fn add_row(&mut self, row: &[f64]) -> Result<()> {
        self.send(PlotEvent::Row {
            values: row.to_vec(),
            new_line: false,
        });
        Ok(())
    }

    async fn add_row_new_line(&mut self, row: &[f64]) -> Result<()> {
        self.send(PlotEvent::Row {
            values: row.to_vec(),
            new_line: true,
        });
        Ok(())
    }

    async fn render_snapshot(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_order_and_new_line() {
        let mut plotter = BroadcastPlotter::new(16);
        let mut rx = plotter.subscribe();

        let columns = vec!["time".to_string(), "p1".to_string()];
        plotter.set_columns(&columns).await.unwrap();
        plotter.add_row_new_line(&[0.0, 1.0]).await.unwrap();
        plotter.add_row(&[1.0, 2.0]).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), PlotEvent::Columns(columns));
        assert_eq!(
            rx.recv().await.unwrap(),
            PlotEvent::Row {
                values: vec![0.0, 1.0],
                new_line: true
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            PlotEvent::Row {
                values: vec![1.0, 2.0],
                new_line: false
            }
        );
    }

    #[tokio::test]
    async fn test_no_subscribers_is_fine() {
        let mut plotter = BroadcastPlotter::new(4);
        plotter.add_row(&[1.0]).await.unwrap();
        assert!(plotter.render_snapshot().await.unwrap().is_none());
    }
}
