use std::{
    fs::File,
    io::{BufRead, BufReader, Lines},
    path::Path,
};

use serde::Deserialize;

use crate::Result;

/// A lazily evaluated stream of raw text records.
///
/// `None` means the stream is permanently exhausted.
pub trait SampleSource {
    /// Pulls the next record from the stream.
    fn next_record(&mut self) -> Option<Result<String>>;

    /// Releases any file or stream resources held by the source.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Adapts any iterator of strings into a `SampleSource`.
#[derive(Debug, Clone)]
pub struct IterSource<I> {
    records: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = String>,
{
    pub fn new<T>(records: T) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        Self {
            records: records.into_iter(),
        }
    }
}

impl<I> SampleSource for IterSource<I>
where
    I: Iterator<Item = String>,
{
    fn next_record(&mut self) -> Option<Result<String>> {
        self.records.next().map(Ok)
    }
}

#[derive(Deserialize)]
struct Document {
    text: String,
}

/// Streams the `text` field of every non blank line of a JSON-lines corpus.
#[derive(Debug)]
pub struct TextStream {
    lines: Option<Lines<BufReader<File>>>,
}

impl TextStream {
    /// Opens a JSON-lines file.
    ///
    /// # Arguments
    /// * `path` - Location of the corpus, one `{"text": ...}` object per line.
    ///
    /// # Returns
    /// A new `TextStream` or the io error raised while opening the file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            lines: Some(BufReader::new(file).lines()),
        })
    }
}

impl SampleSource for TextStream {
    fn next_record(&mut self) -> Option<Result<String>> {
        let lines = self.lines.as_mut()?;

        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };

            if line.trim().is_empty() {
                continue;
            }

            let doc = serde_json::from_str::<Document>(&line).map(|doc| doc.text);
            return Some(doc.map_err(Into::into));
        }
    }

    fn close(&mut self) -> Result<()> {
        self.lines = None;
        Ok(())
    }
}
