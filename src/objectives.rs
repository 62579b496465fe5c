use anyhow::Context as _;

use crate::catalog::{Catalog, Subject};
use crate::cli::ObjectivesArgs;

/// Expands `Letter.numeral` tokens into a criterion-grouped block of
/// objective sentences.
///
/// A header line (`\nA: Analyse`) is emitted whenever the criterion changes;
/// each token then contributes the catalog sentence starting with
/// `"{numeral}."`. Tokens without a matching sentence, and tokens that are not
/// exactly two dot-separated parts, contribute nothing.
pub fn format_objectives<S: AsRef<str>>(tokens: &[S], subject: &Subject, grade: &str) -> String {
    let objectives = subject.objectives(grade);
    let mut lines = Vec::new();
    let mut current: Option<&str> = None;

    for token in tokens {
        let token = token.as_ref().trim();
        let mut parts = token.split('.');
        let (Some(criterion), Some(numeral), None) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let (criterion, numeral) = (criterion.trim(), numeral.trim());

        if current != Some(criterion) {
            let label = subject.famille_criteres.label(criterion).unwrap_or(criterion);
            lines.push(format!("\n{criterion}: {label}"));
            current = Some(criterion);
        }

        let prefix = format!("{numeral}.");
        if let Some(sentence) = objectives
            .and_then(|o| o.get(criterion))
            .and_then(|list| list.iter().find(|s| s.starts_with(&prefix)))
        {
            lines.push(sentence.clone());
        }
    }

    lines.join("\n")
}

pub fn run(args: ObjectivesArgs, catalog: &Catalog) -> anyhow::Result<()> {
    let subject = catalog
        .subject(&args.subject)
        .with_context(|| format!("unknown subject: {}", args.subject))?;
    if subject.objectives(&args.grade).is_none() {
        anyhow::bail!("no objectives for {} in grade {}", subject.id, args.grade);
    }

    let block = format_objectives(&args.tokens, subject, &args.grade);
    tracing::debug!(
        subject = %subject.id,
        grade = %args.grade,
        tokens = args.tokens.len(),
        "format objectives"
    );
    println!("{}", block.trim_start_matches('\n'));
    Ok(())
}
