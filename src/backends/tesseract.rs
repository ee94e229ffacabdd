//! Tesseract, via the `tesseract` CLI tool.
//!
//! We ask for TSV output, which has one row per word with its box and
//! confidence. Words are grouped back into lines using the
//! `(page, block, paragraph, line)` numbers Tesseract assigns.

use std::collections::HashMap;

use image::DynamicImage;
use tokio::process::Command;

use super::{
    BackendCapability, BackendKind, BackendOptions, RecognitionBackend, resolve_executable,
    run_engine, unavailable, write_png,
};
use crate::{
    model::{BoundingBox, RecognitionOutput, TextFragment},
    prelude::*,
};

/// TSV `level` value for a single word.
const TSV_WORD_LEVEL: u32 = 5;

/// Number of columns in a TSV row that carries text.
const TSV_FIELDS: usize = 12;

/// Backend wrapping the `tesseract` CLI tool.
pub struct TesseractBackend {
    executable: PathBuf,
    languages: Vec<String>,
    tessdata_dir: Option<PathBuf>,
}

impl TesseractBackend {
    /// Create a backend from a successful probe.
    pub fn new(
        capability: BackendCapability,
        languages: Vec<String>,
        options: &BackendOptions,
    ) -> Self {
        Self {
            executable: capability.executable,
            languages,
            tessdata_dir: options.tessdata_dir.clone(),
        }
    }

    /// Base command, with our data directory if one was configured.
    fn command(&self) -> Command {
        tesseract_command(&self.executable, self.tessdata_dir.as_deref())
    }
}

fn tesseract_command(executable: &Path, tessdata_dir: Option<&Path>) -> Command {
    let mut cmd = Command::new(executable);
    if let Some(dir) = tessdata_dir {
        cmd.arg("--tessdata-dir").arg(dir);
    }
    cmd
}

#[async_trait]
impl RecognitionBackend for TesseractBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tesseract
    }

    fn languages(&self) -> &[String] {
        &self.languages
    }

    #[instrument(level = "debug", skip_all)]
    async fn recognize(&self, image: &DynamicImage) -> Result<RecognitionOutput> {
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("page.png");
        write_png(image, &input_path).await?;

        let mut cmd = self.command();
        cmd.arg(&input_path)
            .arg("stdout")
            .arg("-l")
            .arg(self.languages.join("+"))
            .arg("tsv");
        let output = run_engine(BackendKind::Tesseract, cmd).await?;
        let tsv = String::from_utf8_lossy(&output.stdout);
        Ok(parse_tsv(&tsv))
    }
}

/// Check that `tesseract` runs and has data for every requested language.
pub async fn probe(languages: &[String], options: &BackendOptions) -> Result<BackendCapability> {
    let kind = BackendKind::Tesseract;
    let executable = resolve_executable(kind, options.tesseract_cmd.as_deref())?;
    if let Some(dir) = &options.tessdata_dir
        && !dir.is_dir()
    {
        return Err(unavailable(kind, format!("tessdata directory {:?}", dir.display())));
    }

    let mut cmd = tesseract_command(&executable, options.tessdata_dir.as_deref());
    cmd.arg("--list-langs");
    let output = run_engine(kind, cmd)
        .await
        .map_err(|err| unavailable(kind, format!("a working tesseract ({err:#})")))?;
    // Older versions print the list on stderr.
    let mut listing = String::from_utf8_lossy(&output.stdout).into_owned();
    listing.push_str(&String::from_utf8_lossy(&output.stderr));
    let available = parse_list_langs(&listing);

    let missing = languages
        .iter()
        .filter(|lang| !available.contains(lang))
        .cloned()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(unavailable(
            kind,
            format!("language data for {}", missing.join(", ")),
        ));
    }

    Ok(BackendCapability {
        backend: kind,
        executable,
        languages: available,
        model_dirs: options.tessdata_dir.iter().cloned().collect(),
    })
}

/// Parse the output of `tesseract --list-langs`.
fn parse_list_langs(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains(' ') && !line.ends_with(':'))
        .map(str::to_owned)
        .collect()
}

/// Key identifying one line of text in Tesseract's layout.
type LineKey = (u32, u32, u32, u32);

/// Normalize Tesseract TSV output.
///
/// - Only word rows are used. Words with blank text are dropped.
/// - Words sharing `(page, block, paragraph, line)` form one line, joined by
///   single spaces, in the order Tesseract emitted them. Lines are joined by
///   `\n`.
/// - Negative confidences mean "unknown" and are left out of the average.
/// - There is one fragment per word.
pub fn parse_tsv(tsv: &str) -> RecognitionOutput {
    let mut line_order: Vec<Vec<String>> = vec![];
    let mut line_index: HashMap<LineKey, usize> = HashMap::new();
    let mut fragments = vec![];

    for row in tsv.lines() {
        let fields = row.split('\t').collect::<Vec<_>>();
        if fields.len() < TSV_FIELDS {
            continue;
        }
        // Also skips the header row, whose level is not a number.
        if fields[0].trim().parse::<u32>().ok() != Some(TSV_WORD_LEVEL) {
            continue;
        }
        let text = fields[11].trim();
        if text.is_empty() {
            continue;
        }

        let number = |i: usize| fields[i].trim().parse::<u32>().unwrap_or(0);
        let key = (number(1), number(2), number(3), number(4));
        let confidence = fields[10]
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|conf| *conf >= 0.0);

        let slot = *line_index.entry(key).or_insert_with(|| {
            line_order.push(vec![]);
            line_order.len() - 1
        });
        line_order[slot].push(text.to_owned());

        fragments.push(TextFragment {
            text: text.to_owned(),
            bbox: BoundingBox::new(number(6), number(7), number(8), number(9)),
            confidence,
        });
    }

    let text = line_order
        .iter()
        .map(|words| words.join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    RecognitionOutput::from_fragments(text, fragments)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    fn tsv(rows: &[&str]) -> String {
        let mut out = vec![HEADER];
        out.extend_from_slice(rows);
        out.join("\n")
    }

    #[test]
    fn words_are_grouped_into_lines() {
        let output = parse_tsv(&tsv(&[
            "1\t1\t0\t0\t0\t0\t0\t0\t640\t480\t-1\t",
            "4\t1\t1\t1\t1\t0\t10\t10\t200\t20\t-1\t",
            "5\t1\t1\t1\t1\t1\t10\t10\t50\t20\t80\tHello",
            "5\t1\t1\t1\t1\t2\t70\t10\t60\t20\t-1\tWorld",
            "5\t1\t1\t1\t2\t1\t10\t40\t40\t20\t60\tBye",
        ]));
        assert_eq!(output.text, "Hello World\nBye");
        assert_eq!(output.confidence, Some(70.0));
        assert_eq!(output.fragments.len(), 3);
        assert_eq!(output.fragments[0].bbox, BoundingBox::new(10, 10, 50, 20));
        assert_eq!(output.fragments[1].confidence, None);
    }

    #[test]
    fn blank_words_are_skipped() {
        let output = parse_tsv(&tsv(&[
            "5\t1\t1\t1\t1\t1\t10\t10\t50\t20\t95\t   ",
            "5\t1\t1\t1\t1\t2\t70\t10\t60\t20\t90\tok",
        ]));
        assert_eq!(output.text, "ok");
        assert_eq!(output.fragments.len(), 1);
        assert_eq!(output.confidence, Some(90.0));
    }

    #[test]
    fn lines_keep_first_appearance_order() {
        // A line number that reappears later still belongs to its first line.
        let output = parse_tsv(&tsv(&[
            "5\t1\t1\t1\t2\t1\t0\t0\t1\t1\t50\tsecond",
            "5\t1\t1\t1\t1\t1\t0\t0\t1\t1\t50\tfirst",
            "5\t1\t1\t1\t2\t2\t0\t0\t1\t1\t50\tagain",
        ]));
        assert_eq!(output.text, "second again\nfirst");
    }

    #[test]
    fn same_line_number_in_other_block_is_a_new_line() {
        let output = parse_tsv(&tsv(&[
            "5\t1\t1\t1\t1\t1\t0\t0\t1\t1\t50\tleft",
            "5\t1\t2\t1\t1\t1\t0\t0\t1\t1\t50\tright",
        ]));
        assert_eq!(output.text, "left\nright");
    }

    #[test]
    fn empty_output_has_no_confidence() {
        let output = parse_tsv(HEADER);
        assert_eq!(output.text, "");
        assert_eq!(output.confidence, None);
        assert!(output.fragments.is_empty());
    }

    #[test]
    fn list_langs_output_is_parsed() {
        let listing = "List of available languages in \"/usr/share/tessdata/\" (3):\neng\nosd\npol\n";
        assert_eq!(parse_list_langs(listing), vec!["eng", "osd", "pol"]);
    }

    #[tokio::test]
    #[ignore = "Requires tesseract to be installed"]
    async fn tesseract_reads_rendered_text() -> Result<()> {
        let options = BackendOptions::default();
        let languages = vec!["eng".to_owned()];
        let capability = probe(&languages, &options).await?;
        let backend = TesseractBackend::new(capability, languages, &options);
        let image = image::DynamicImage::new_rgb8(200, 80);
        let output = backend.recognize(&image).await?;
        assert!(output.confidence.is_none_or(|c| (0.0..=100.0).contains(&c)));
        Ok(())
    }
}
