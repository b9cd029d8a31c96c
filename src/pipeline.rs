//! Per-connection processing pipeline.
//!
//! Every decoded [`HttpObject`] enters the pipeline right after the decoder and runs
//! through the named stages in order; whatever falls out of the last stage reaches the
//! interceptors. Stages may be spliced in and out while the connection is live, which
//! is how the full-message adapter switches a single message to buffered mode.
use crate::codec::HttpObject;
use crate::errors::{Error, Result};

/// Name of the implicit protocol decoding stage every pipeline is anchored on.
pub const DECODER: &str = "decoder";
/// Name of the content decompression stage.
pub const DECOMPRESS: &str = "decompress";
/// Name of the body aggregation stage.
pub const AGGREGATOR: &str = "aggregator";

/// One step of a [`Pipeline`].
///
/// A stage consumes one object and pushes zero or more objects to `out`, which are
/// handed to the next stage.
pub trait Stage<H>: Send {
  /// Process `object`.
  fn process(&mut self, object: HttpObject<H>, out: &mut Vec<HttpObject<H>>) -> Result<()>;
}

/// Ordered list of named stages for one side of a connection.
pub struct Pipeline<H> {
  stages: Vec<(String, Box<dyn Stage<H>>)>,
}

impl<H> Default for Pipeline<H> {
  fn default() -> Self {
    Pipeline { stages: Vec::new() }
  }
}

impl<H> std::fmt::Debug for Pipeline<H> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_list().entry(&DECODER).entries(self.names()).finish()
  }
}

impl<H> Pipeline<H> {
  /// An empty pipeline: objects pass straight from the decoder to the handler.
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert `stage` as `name` right after `anchor`.
  ///
  /// Returns `Ok(false)` without touching the pipeline when a stage called `name` is
  /// already present, and an error when `anchor` is unknown.
  pub fn add_after<S>(&mut self, anchor: &str, name: &str, stage: S) -> Result<bool>
  where
    S: Stage<H> + 'static,
  {
    if self.contains(name) {
      return Ok(false);
    }
    let index = if anchor == DECODER {
      0
    } else {
      match self.position(anchor) {
        Some(index) => index + 1,
        None => {
          return Err(Error::Other(format!(
            "no pipeline stage named `{}`",
            anchor
          )))
        }
      }
    };
    self.stages.insert(index, (name.to_string(), Box::new(stage)));
    Ok(true)
  }

  /// Remove the stage called `name`; `false` when there was none.
  pub fn remove(&mut self, name: &str) -> bool {
    match self.position(name) {
      Some(index) => {
        self.stages.remove(index);
        true
      }
      None => false,
    }
  }

  /// `true` when a stage called `name` is installed.
  pub fn contains(&self, name: &str) -> bool {
    name == DECODER || self.position(name).is_some()
  }

  /// Names of the installed stages, decoder excluded, in processing order.
  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.stages.iter().map(|(name, _)| name.as_str())
  }

  /// Run `object` through every stage and return what comes out the other end.
  pub fn fire(&mut self, object: HttpObject<H>) -> Result<Vec<HttpObject<H>>> {
    let mut current = vec![object];
    for (_, stage) in self.stages.iter_mut() {
      let mut next = Vec::with_capacity(current.len());
      for object in current {
        stage.process(object, &mut next)?;
      }
      if next.is_empty() {
        return Ok(next);
      }
      current = next;
    }
    Ok(current)
  }

  fn position(&self, name: &str) -> Option<usize> {
    self.stages.iter().position(|(n, _)| n == name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::ResponseHead;
  use bytes::Bytes;

  struct Upper;
  impl Stage<ResponseHead> for Upper {
    fn process(
      &mut self,
      object: HttpObject<ResponseHead>,
      out: &mut Vec<HttpObject<ResponseHead>>,
    ) -> Result<()> {
      match object {
        HttpObject::Content(data) => out.push(HttpObject::Content(Bytes::from(
          data.to_ascii_uppercase(),
        ))),
        other => out.push(other),
      }
      Ok(())
    }
  }

  struct Swallow;
  impl Stage<ResponseHead> for Swallow {
    fn process(
      &mut self,
      _object: HttpObject<ResponseHead>,
      _out: &mut Vec<HttpObject<ResponseHead>>,
    ) -> Result<()> {
      Ok(())
    }
  }

  #[test]
  fn add_after_orders_stages() {
    let mut pipeline = Pipeline::<ResponseHead>::new();
    assert!(pipeline.add_after(DECODER, "b", Upper).unwrap());
    assert!(pipeline.add_after(DECODER, "a", Upper).unwrap());
    assert!(pipeline.add_after("a", "c", Upper).unwrap());
    assert_eq!(pipeline.names().collect::<Vec<_>>(), ["a", "c", "b"]);
  }

  #[test]
  fn add_after_is_idempotent() {
    let mut pipeline = Pipeline::<ResponseHead>::new();
    assert!(pipeline.add_after(DECODER, DECOMPRESS, Upper).unwrap());
    assert!(!pipeline.add_after(DECODER, DECOMPRESS, Upper).unwrap());
    assert_eq!(pipeline.names().count(), 1);
  }

  #[test]
  fn add_after_unknown_anchor_fails() {
    let mut pipeline = Pipeline::<ResponseHead>::new();
    assert!(pipeline.add_after("missing", "x", Upper).is_err());
    assert!(!pipeline.remove("x"));
  }

  #[test]
  fn fire_runs_stages_in_order() {
    let mut pipeline = Pipeline::<ResponseHead>::new();
    let out = pipeline
      .fire(HttpObject::Content(Bytes::from_static(b"abc")))
      .unwrap();
    assert!(matches!(&out[..], [HttpObject::Content(b)] if b.as_ref() == b"abc"));

    pipeline.add_after(DECODER, "upper", Upper).unwrap();
    let out = pipeline
      .fire(HttpObject::Content(Bytes::from_static(b"abc")))
      .unwrap();
    assert!(matches!(&out[..], [HttpObject::Content(b)] if b.as_ref() == b"ABC"));

    pipeline.add_after("upper", "swallow", Swallow).unwrap();
    assert!(pipeline
      .fire(HttpObject::Content(Bytes::from_static(b"abc")))
      .unwrap()
      .is_empty());
    assert!(pipeline.remove("swallow"));
    assert!(!pipeline.contains("swallow"));
  }
}
