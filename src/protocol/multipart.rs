use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};

use bytes::Bytes;
use temp_dir::TempDir;
use tracing::{debug, error, warn};

use super::{find, ByteMultiMap};

/// Longest line the extractor reads in one step.
const MAX_LINE: u64 = 65536;

/// Disk spool for a multipart request body. The temp directory also hosts
/// the per-part upload files; everything is deleted when the owning request
/// is dropped.
pub(crate) struct BodySpool {
    dir: TempDir,
    file: File,
    pub(crate) size: u64,
}

impl BodySpool {
    pub(crate) fn create() -> io::Result<Self> {
        let dir = TempDir::new()?;
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.child("request-body"))?;
        Ok(Self { dir, file, size: 0 })
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.size += data.len() as u64;
        Ok(())
    }
}

/// A file uploaded through a `multipart/form-data` part. The handle is open
/// and positioned at the start of the content; the backing file lives as
/// long as the request.
#[derive(Debug)]
pub struct UploadedFile {
    file: File,
    len: u64,
}

impl UploadedFile {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

/// Parse the spooled multipart body. Form fields land in `parameters`;
/// uploads land in `parameters` (field -> filename) and in `uploads`
/// (field -> file handle). Field-value bytes are counted into
/// `current_size`. Read failures leave whatever was extracted so far.
pub(crate) fn extract(
    spool: &mut BodySpool,
    boundary: &[u8],
    parameters: &mut ByteMultiMap,
    uploads: &mut HashMap<Bytes, UploadedFile>,
    current_size: &mut usize,
) {
    debug!("parsing multipart spool");
    if let Err(e) = extract_inner(spool, boundary, parameters, uploads, current_size) {
        error!(cause = %e, "cannot read multipart spool");
    }
}

fn extract_inner(
    spool: &mut BodySpool,
    boundary: &[u8],
    parameters: &mut ByteMultiMap,
    uploads: &mut HashMap<Bytes, UploadedFile>,
    current_size: &mut usize,
) -> io::Result<()> {
    let mut delimiter = Vec::with_capacity(boundary.len() + 2);
    delimiter.extend_from_slice(b"--");
    delimiter.extend_from_slice(boundary);

    let dir = &spool.dir;
    let mut spool_file = &spool.file;
    spool_file.flush()?;
    spool_file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(spool_file);
    let mut upload_count = 0usize;

    let mut finished = false;
    while !finished {
        // part headers, up to the blank separator line
        let mut field_name: Vec<u8> = Vec::new();
        let mut file_name: Vec<u8> = Vec::new();
        loop {
            let Some(line) = read_line(&mut reader)? else {
                return Ok(());
            };
            let line = line.trim_ascii();
            if line.starts_with(b"Content-Disposition:") {
                if find(line, b"form-data").is_some() {
                    if let Some(name) = quoted_token(line, b" name=\"") {
                        field_name = name;
                    }
                    if let Some(name) = quoted_token(line, b" filename=\"") {
                        file_name = name;
                    }
                }
            } else if line.is_empty() {
                break;
            }
        }

        // part data, up to the next boundary line
        let mut upload: Option<(File, u64)> = None;
        let mut field_value: Vec<u8> = Vec::new();
        loop {
            let Some(line) = read_line(&mut reader)? else {
                finished = true;
                break;
            };
            if line.starts_with(&delimiter) {
                // the datum has collected the CRLF preceding the boundary
                if file_name.is_empty() && !field_name.is_empty() {
                    if field_value.len() >= 2 {
                        field_value.truncate(field_value.len() - 2);
                    }
                    parameters.insert(field_name.clone(), field_value.clone());
                } else if !file_name.is_empty() && !field_name.is_empty() {
                    if let Some((file, mut len)) = upload.take() {
                        if len >= 2 {
                            len -= 2;
                            file.set_len(len)?;
                        }
                        (&file).flush()?;
                        (&file).seek(SeekFrom::Start(0))?;
                        parameters.insert(field_name.clone(), file_name.clone());
                        uploads.insert(
                            Bytes::copy_from_slice(&field_name),
                            UploadedFile { file, len },
                        );
                    } else {
                        warn!("multipart format error, unexpected end of file data");
                    }
                }
                if line[delimiter.len()..].starts_with(b"--") {
                    finished = true;
                }
                break;
            }
            if file_name.is_empty() && !field_name.is_empty() {
                *current_size += line.len();
                field_value.extend_from_slice(&line);
            } else if !file_name.is_empty() && !field_name.is_empty() {
                if upload.is_none() {
                    let file = File::options()
                        .read(true)
                        .write(true)
                        .create(true)
                        .open(dir.child(format!("upload-{upload_count}")))?;
                    upload_count += 1;
                    upload = Some((file, 0));
                }
                if let Some((file, len)) = upload.as_mut() {
                    file.write_all(&line)?;
                    *len += line.len() as u64;
                }
            }
        }
    }
    Ok(())
}

/// Read one line including its newline, at most `MAX_LINE` bytes.
/// `None` at end of file.
fn read_line(reader: &mut BufReader<&File>) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let n = (&mut *reader).take(MAX_LINE).read_until(b'\n', &mut line)?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// Value of a `token="..."` attribute inside a header line.
fn quoted_token(line: &[u8], marker: &[u8]) -> Option<Vec<u8>> {
    let start = find(line, marker)? + marker.len();
    let end = start + find(&line[start..], b"\"")?;
    Some(line[start..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spool_with(body: &[u8]) -> BodySpool {
        let mut spool = BodySpool::create().unwrap();
        spool.write(body).unwrap();
        spool
    }

    #[test]
    fn extracts_fields_and_files() {
        let body = b"--XYZ\r\n\
            Content-Disposition: form-data; name=\"name\"\r\n\
            \r\n\
            alice\r\n\
            --XYZ\r\n\
            Content-Disposition: form-data; name=\"avatar\"; filename=\"a.png\"\r\n\
            Content-Type: image/png\r\n\
            \r\n\
            abc\r\n\
            --XYZ--\r\n";
        let mut spool = spool_with(body);
        let mut parameters = ByteMultiMap::default();
        let mut uploads = HashMap::new();
        let mut current_size = 0;
        extract(&mut spool, b"XYZ", &mut parameters, &mut uploads, &mut current_size);

        assert_eq!(&parameters.get(b"name").unwrap()[..], b"alice");
        assert_eq!(&parameters.get(b"avatar").unwrap()[..], b"a.png");
        let upload = uploads.get(&b"avatar"[..]).unwrap();
        assert_eq!(upload.len(), 3);
        let mut content = Vec::new();
        let mut file = upload.file();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"abc");
        assert!(current_size > 0);
    }

    #[test]
    fn multi_line_field_value_keeps_inner_newlines() {
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"text\"\r\n\
            \r\n\
            line one\r\n\
            line two\r\n\
            --B--\r\n";
        let mut spool = spool_with(body);
        let mut parameters = ByteMultiMap::default();
        let mut uploads = HashMap::new();
        let mut current_size = 0;
        extract(&mut spool, b"B", &mut parameters, &mut uploads, &mut current_size);

        assert_eq!(&parameters.get(b"text").unwrap()[..], b"line one\r\nline two");
        assert!(uploads.is_empty());
    }

    #[test]
    fn truncated_body_without_final_boundary() {
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"f\"; filename=\"x\"\r\n\
            \r\n\
            data";
        let mut spool = spool_with(body);
        let mut parameters = ByteMultiMap::default();
        let mut uploads = HashMap::new();
        let mut current_size = 0;
        // the part never sees its closing boundary, so nothing is recorded
        extract(&mut spool, b"B", &mut parameters, &mut uploads, &mut current_size);
        assert!(parameters.is_empty());
        assert!(uploads.is_empty());
    }
}
