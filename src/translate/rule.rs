use crate::config::DatabaseProfile;
use crate::db::schema::SchemaSnapshot;
use crate::error::QueryError;
use crate::translate::{StepKind, Translation, TranslationRequest};
use regex::Regex;
use std::collections::HashSet;
use tracing::debug;

const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u32 = 100;
const SIMPLIFIED_TOKENS: usize = 3;

/// Closed category map from technology keywords (both languages) to the
/// term searched in title/abstract. One condition per category.
const TECH_TERMS: &[(&str, &[&str])] = &[
    ("camera", &["カメラ", "撮影", "camera", "imaging"]),
    ("vehicle", &["自動車", "車両", "vehicle", "automotive", "automobile"]),
    (
        "semiconductor",
        &["半導体", "ウェハー", "semiconductor", "wafer", "integrated circuit"],
    ),
    ("battery", &["電池", "バッテリー", "battery", "batteries"]),
    ("display", &["ディスプレイ", "画面", "display", "monitor", "screen"]),
    (
        "communication",
        &["通信", "無線", "ネットワーク", "communication", "wireless", "network"],
    ),
    ("medical", &["医療", "診断", "治療", "medical", "diagnosis", "healthcare"]),
];

const CORPORATE_SUFFIXES: &[&str] = &[
    "株式会社",
    "(株)",
    "工業",
    "製作所",
    "Inc",
    "Corp",
    "Corporation",
    "Ltd",
    "LLC",
    "GmbH",
    "K.K.",
];

const EN_STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "of", "in", "on", "for", "with", "from", "by", "to", "is",
    "are", "show", "find", "get", "list", "display", "fetch", "return", "me", "patents", "patent",
    "published", "filed", "application", "applications", "after", "before", "between", "related",
    "about", "concerning", "regarding", "latest", "newest", "recent", "oldest", "earliest", "how",
    "many", "count", "all", "top",
];

const JP_STOP_TOKENS: &[&str] = &[
    "特許",
    "出願",
    "発明",
    "最新",
    "最近",
    "新しい",
    "古い",
    "今年",
    "昨年",
    "以前",
    "以降",
    "何件",
    "件数",
    "関連",
    "について",
    "ください",
    "見せて",
    "教えて",
];

const JP_PARTICLES: &[&str] = &[
    "を", "が", "は", "の", "に", "へ", "で", "と", "から", "まで", "や", "も",
];

/// Physical column names the extraction rules emit against, resolved from
/// the snapshot (display labels bias resolution, physical names win).
#[derive(Debug, Clone)]
struct ColumnProfile {
    filing_date: String,
    applicant: String,
    inventor: String,
    title: String,
    abstract_col: String,
    ipc: String,
    application_number: String,
    publication_number: String,
}

impl ColumnProfile {
    fn resolve(snapshot: &SchemaSnapshot, table: &str) -> Self {
        let pick = |candidates: &[&str]| -> String {
            snapshot
                .resolve_column(table, candidates)
                .unwrap_or_else(|| candidates[0].to_string())
        };

        Self {
            filing_date: pick(&["filing_date", "application_date", "publication_date", "出願日"]),
            applicant: pick(&["applicant_name", "applicant", "assignee_harmonized", "出願人"]),
            inventor: pick(&["inventor_name", "inventor", "発明者"]),
            title: pick(&["title", "title_ja", "invention_title", "発明の名称", "タイトル"]),
            abstract_col: pick(&["abstract", "abstract_ja", "summary", "要約"]),
            ipc: pick(&["ipc_code", "ipc", "classification", "IPC"]),
            application_number: pick(&["application_number", "出願番号"]),
            publication_number: pick(&["publication_number", "公開番号"]),
        }
    }
}

/// Deterministic pattern extractor. Produces a single read-only SELECT
/// against the primary table of the selected database, or NoRuleMatch when
/// nothing was extracted.
pub struct RuleTranslator {
    year_re: Regex,
    ipc_re: Regex,
    quoted_re: Regex,
    jp_possessive_re: Regex,
    jp_applicant_marked_re: Regex,
    jp_company_quoted_re: Regex,
    en_applicant_re: Regex,
    jp_inventor_re: Regex,
    en_inventor_re: Regex,
    app_number_re: Regex,
    pub_number_re: Regex,
    jp_about_re: Regex,
    en_about_re: Regex,
    jp_limit_re: Regex,
    max_limit_re: Regex,
    en_limit_re: Regex,
    token_split_re: Regex,
}

impl RuleTranslator {
    pub fn new() -> Self {
        Self {
            year_re: Regex::new(r"(?:19|20)\d{2}").unwrap(),
            ipc_re: Regex::new(r"[A-Ha-h][0-9]{2}[A-Za-z][0-9]{0,6}(?:/[0-9]{2,6})?").unwrap(),
            quoted_re: Regex::new(r#""([^"]+)""#).unwrap(),
            jp_possessive_re: Regex::new(r#"([^\s、。,の「」"]+)の"#).unwrap(),
            jp_applicant_marked_re: Regex::new(
                r#"(?:出願人|申請者|会社|企業)(?:は|が|の)\s*「?([^」\s、。,の"]+)」?"#,
            )
            .unwrap(),
            jp_company_quoted_re: Regex::new(r"「([^」]+)」(?:による|からの?|の)(?:特許|出願)")
                .unwrap(),
            en_applicant_re: Regex::new(
                r"(?:\bby\b|\bfrom\b|\bof\b)\s+([A-Z][A-Za-z0-9&.\-]*(?:\s+[A-Z][A-Za-z0-9&.\-]*)*)",
            )
            .unwrap(),
            jp_inventor_re: Regex::new(r#"(?:発明者|考案者)(?:は|が|の)\s*「?([^」\s、。,の"]+)」?"#)
                .unwrap(),
            en_inventor_re: Regex::new(
                r"(?:\binventor\b|\binvented by\b)\s+(?:is\s+)?([A-Z][A-Za-z.\-]*(?:\s+[A-Z][A-Za-z.\-]*)*)",
            )
            .unwrap(),
            app_number_re: Regex::new(
                r"(?i)(?:出願番号|application\s*(?:number|no\.?)?)\D{0,12}?(\d{4}-\d+|\d{6,12})",
            )
            .unwrap(),
            pub_number_re: Regex::new(
                r"(?i)(?:公開番号|公報番号|publication\s*(?:number|no\.?)?)\D{0,12}?(\d{4}-\d+|\d{6,12})",
            )
            .unwrap(),
            jp_about_re: Regex::new(r"([^\s、。,の]+?)(?:に関する|に関連する|について|に関し)")
                .unwrap(),
            en_about_re: Regex::new(r"(?i)(?:about|related to|concerning|regarding)\s+([^,.?]+)")
                .unwrap(),
            jp_limit_re: Regex::new(r"(\d+)\s*(?:件|個|つ)").unwrap(),
            max_limit_re: Regex::new(r"(?i)(?:最大|最多|limit|top)\s*(\d+)").unwrap(),
            en_limit_re: Regex::new(
                r"(?i)(?:show|get|return|find|fetch|list|display)\s+(?:me\s+)?(?:the\s+)?(?:top\s+)?(\d+)",
            )
            .unwrap(),
            token_split_re: Regex::new(r"\W+").unwrap(),
        }
    }

    pub fn translate(
        &self,
        request: &TranslationRequest,
        snapshot: &SchemaSnapshot,
        profile: &DatabaseProfile,
    ) -> Result<Translation, QueryError> {
        if snapshot.is_empty() {
            return Err(QueryError::EmptySchema(request.db.clone()));
        }

        let table = self.pick_table(snapshot, profile);
        let columns = ColumnProfile::resolve(snapshot, &table);
        let question = request.question.as_str();
        let lowered = question.to_lowercase();

        let mut conjuncts: Vec<String> = Vec::new();
        let mut claimed: HashSet<String> = HashSet::new();

        // 1. Year / date ranges.
        let years = self.extract_years(question);
        claimed.extend(years.iter().cloned());
        if !years.is_empty() {
            conjuncts.push(year_condition(&years, &lowered, question, &columns.filing_date));
        }

        // 4 and 5 run early so their captures do not leak into the
        // applicant and about heuristics.
        let ipc_codes = self.extract_ipc(question);
        claimed.extend(ipc_codes.iter().cloned());

        let app_number = self
            .app_number_re
            .captures(question)
            .map(|c| c[1].to_string());
        let pub_number = self
            .pub_number_re
            .captures(question)
            .map(|c| c[1].to_string());
        claimed.extend(app_number.iter().cloned());
        claimed.extend(pub_number.iter().cloned());

        // 6. Technology-term dictionary hits claim their keyword.
        let tech_hits = self.extract_tech_terms(&lowered);
        claimed.extend(tech_hits.iter().map(|t| t.to_lowercase()));

        // 7. Double-quoted free text.
        let quoted_terms: Vec<String> = self
            .quoted_re
            .captures_iter(question)
            .map(|c| c[1].to_string())
            .filter(|t| t.chars().count() > 1)
            .collect();
        claimed.extend(quoted_terms.iter().cloned());

        // 8. About / related-to trailing phrases.
        let about_terms = self.extract_about_terms(question, &claimed);
        claimed.extend(about_terms.iter().cloned());

        // 2. Applicant / assignee.
        if let Some(applicant) = self.extract_applicant(question, &claimed) {
            conjuncts.push(format!(
                "{} LIKE '%{}%'",
                columns.applicant,
                escape_like(&applicant)
            ));
            claimed.insert(applicant);
        }

        // 3. Inventor, symmetric to rule 2.
        if let Some(inventor) = self.extract_inventor(question) {
            conjuncts.push(format!(
                "{} LIKE '%{}%'",
                columns.inventor,
                escape_like(&inventor)
            ));
            claimed.insert(inventor);
        }

        if !ipc_codes.is_empty() {
            let parts: Vec<String> = ipc_codes
                .iter()
                .map(|code| format!("{} LIKE '%{}%'", columns.ipc, escape_like(code)))
                .collect();
            conjuncts.push(group(parts, " OR "));
        }

        if let Some(number) = &app_number {
            conjuncts.push(format!(
                "{} LIKE '%{}%'",
                columns.application_number,
                escape_like(number)
            ));
        }
        if let Some(number) = &pub_number {
            conjuncts.push(format!(
                "{} LIKE '%{}%'",
                columns.publication_number,
                escape_like(number)
            ));
        }

        for term in &tech_hits {
            conjuncts.push(text_condition(term, &columns));
        }
        for term in &quoted_terms {
            conjuncts.push(text_condition(term, &columns));
        }
        for term in &about_terms {
            conjuncts.push(text_condition(term, &columns));
        }

        dedup_in_place(&mut conjuncts);

        if conjuncts.is_empty() {
            return Err(QueryError::NoRuleMatch);
        }

        // 9 and 10. Limit and sort preference.
        let limit = self.extract_limit(question);
        let aggregate = self.wants_count(&lowered);
        let order = sort_direction(&lowered);

        let mut sql = if aggregate {
            format!("SELECT COUNT(*) FROM {}", table)
        } else {
            format!("SELECT * FROM {}", table)
        };
        sql.push_str(" WHERE ");
        sql.push_str(&conjuncts.join(" AND "));
        if !aggregate {
            sql.push_str(&format!(" ORDER BY {} {}", columns.filing_date, order));
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        debug!("Rule translation for '{}': {}", request.question, sql);

        let mut notes = conjuncts.clone();
        if aggregate {
            notes.push("aggregate count query, limit omitted".to_string());
        } else {
            notes.push(format!("order by {} {}", columns.filing_date, order));
            notes.push(format!("limit {}", limit));
        }

        Ok(Translation {
            sql,
            step: StepKind::Rule,
            notes,
        })
    }

    /// Post-execution-error retry: discard every extraction except the
    /// three longest non-stopword tokens, applied disjunctively across the
    /// title, abstract and applicant columns.
    pub fn simplified(
        &self,
        request: &TranslationRequest,
        snapshot: &SchemaSnapshot,
        profile: &DatabaseProfile,
    ) -> Result<Translation, QueryError> {
        if snapshot.is_empty() {
            return Err(QueryError::EmptySchema(request.db.clone()));
        }

        let table = self.pick_table(snapshot, profile);
        let columns = ColumnProfile::resolve(snapshot, &table);

        let mut seen = HashSet::new();
        let mut tokens: Vec<String> = self
            .token_split_re
            .split(&request.question)
            .flat_map(split_jp_particles)
            .filter(|t| is_significant_token(t))
            .filter(|t| seen.insert(t.clone()))
            .collect();
        tokens.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));
        tokens.truncate(SIMPLIFIED_TOKENS);

        if tokens.is_empty() {
            return Err(QueryError::NoRuleMatch);
        }

        let parts: Vec<String> = tokens
            .iter()
            .map(|t| {
                let term = escape_like(t);
                format!(
                    "({} LIKE '%{}%' OR {} LIKE '%{}%' OR {} LIKE '%{}%')",
                    columns.title, term, columns.abstract_col, term, columns.applicant, term
                )
            })
            .collect();

        let sql = format!(
            "SELECT * FROM {} WHERE {} LIMIT {}",
            table,
            parts.join(" OR "),
            DEFAULT_LIMIT
        );

        debug!("Simplified rule translation for '{}': {}", request.question, sql);

        Ok(Translation {
            sql,
            step: StepKind::RuleSimplified,
            notes: tokens.iter().map(|t| format!("token: {}", t)).collect(),
        })
    }

    fn pick_table(&self, snapshot: &SchemaSnapshot, profile: &DatabaseProfile) -> String {
        if snapshot
            .table(&profile.primary_table)
            .map(|t| t.is_populated())
            .unwrap_or(false)
        {
            return profile.primary_table.clone();
        }
        snapshot
            .tables
            .iter()
            .find(|t| t.is_populated())
            .map(|t| t.name.clone())
            .unwrap_or_else(|| profile.primary_table.clone())
    }

    fn extract_years(&self, question: &str) -> Vec<String> {
        self.year_re
            .find_iter(question)
            .filter(|m| {
                !is_alnum_before(question, m.start()) && !is_alnum_after(question, m.end())
            })
            .map(|m| m.as_str().to_string())
            .collect()
    }

    fn extract_ipc(&self, question: &str) -> Vec<String> {
        let mut codes: Vec<String> = self
            .ipc_re
            .find_iter(question)
            .filter(|m| {
                !is_alnum_before(question, m.start()) && !is_alnum_after(question, m.end())
            })
            .map(|m| m.as_str().to_uppercase())
            .collect();
        codes.dedup();
        codes
    }

    fn extract_tech_terms(&self, lowered: &str) -> Vec<String> {
        let mut hits = Vec::new();
        for (_category, synonyms) in TECH_TERMS {
            for synonym in *synonyms {
                if contains_term(lowered, synonym) {
                    hits.push(synonym.to_string());
                    break;
                }
            }
        }
        hits
    }

    fn extract_about_terms(&self, question: &str, claimed: &HashSet<String>) -> Vec<String> {
        let mut terms = Vec::new();

        for cap in self.jp_about_re.captures_iter(question) {
            let term = cap[1].to_string();
            if term.chars().count() > 1 && !is_claimed(&term, claimed) {
                terms.push(term);
            }
        }

        if let Some(cap) = self.en_about_re.captures(question) {
            let mut phrase = cap[1].trim().to_string();
            for separator in [" and ", " or ", " with ", " from ", " to ", " by ", " show "] {
                if let Some(idx) = phrase.find(separator) {
                    phrase.truncate(idx);
                }
            }
            for token in phrase.split_whitespace() {
                let token = token.trim_matches(|c: char| !c.is_alphanumeric());
                if is_significant_token(token) && !is_claimed(token, claimed) {
                    terms.push(token.to_string());
                }
            }
        }

        terms
    }

    fn extract_applicant(&self, question: &str, claimed: &HashSet<String>) -> Option<String> {
        if let Some(cap) = self.jp_company_quoted_re.captures(question) {
            return Some(cap[1].to_string());
        }
        if let Some(cap) = self.jp_applicant_marked_re.captures(question) {
            return Some(cap[1].to_string());
        }
        if let Some(cap) = self.en_applicant_re.captures(question) {
            let name = cap[1].trim().to_string();
            if name.chars().count() > 2 && !is_claimed(&name, claimed) {
                return Some(name);
            }
        }

        // Possessive fallback: tokens directly before の, filtered down to
        // plausible names. Corporate suffixes win over position.
        let candidates: Vec<String> = self
            .jp_possessive_re
            .captures_iter(question)
            .map(|c| c[1].to_string())
            .filter(|t| is_name_candidate(t, claimed))
            .collect();

        candidates
            .iter()
            .find(|c| has_corporate_suffix(c))
            .or_else(|| candidates.first())
            .cloned()
    }

    fn extract_inventor(&self, question: &str) -> Option<String> {
        if let Some(cap) = self.jp_inventor_re.captures(question) {
            return Some(cap[1].to_string());
        }
        if let Some(cap) = self.en_inventor_re.captures(question) {
            let name = cap[1].trim().to_string();
            if name.chars().count() > 2 {
                return Some(name);
            }
        }
        None
    }

    fn extract_limit(&self, question: &str) -> u32 {
        for re in [&self.jp_limit_re, &self.max_limit_re, &self.en_limit_re] {
            if let Some(cap) = re.captures(question) {
                if let Ok(n) = cap[1].parse::<u32>() {
                    return n.clamp(1, MAX_LIMIT);
                }
            }
        }
        DEFAULT_LIMIT
    }

    fn wants_count(&self, lowered: &str) -> bool {
        lowered.contains("何件")
            || lowered.contains("件数")
            || lowered.contains("how many")
            || contains_term(lowered, "count")
    }
}

impl Default for RuleTranslator {
    fn default() -> Self {
        Self::new()
    }
}

fn year_condition(years: &[String], lowered: &str, question: &str, date_col: &str) -> String {
    let range_marker = lowered.contains("between")
        || (question.contains("から") && question.contains("まで"));

    if years.len() >= 2 && range_marker {
        let low = years.iter().min().cloned().unwrap_or_default();
        let high = years.iter().max().cloned().unwrap_or_default();
        return format!(
            "(strftime('%Y', {}) >= '{}' AND strftime('%Y', {}) <= '{}')",
            date_col, low, date_col, high
        );
    }

    let op = if question.contains("以前") || question.contains("より前") || lowered.contains("before")
    {
        "<="
    } else if question.contains("以降")
        || question.contains("より後")
        || question.contains("以後")
        || lowered.contains("after")
        || lowered.contains("since")
    {
        ">="
    } else {
        "="
    };

    let parts: Vec<String> = years
        .iter()
        .map(|year| format!("strftime('%Y', {}) {} '{}'", date_col, op, year))
        .collect();
    group(parts, " OR ")
}

fn text_condition(term: &str, columns: &ColumnProfile) -> String {
    let escaped = escape_like(term);
    format!(
        "({} LIKE '%{}%' OR {} LIKE '%{}%')",
        columns.title, escaped, columns.abstract_col, escaped
    )
}

fn group(parts: Vec<String>, joiner: &str) -> String {
    if parts.len() == 1 {
        parts.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", parts.join(joiner))
    }
}

fn dedup_in_place(conjuncts: &mut Vec<String>) {
    let mut seen = HashSet::new();
    conjuncts.retain(|c| seen.insert(c.clone()));
}

fn escape_like(term: &str) -> String {
    term.replace('\'', "''")
}

fn is_alnum_before(text: &str, idx: usize) -> bool {
    text[..idx]
        .chars()
        .next_back()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false)
}

fn is_alnum_after(text: &str, idx: usize) -> bool {
    text[idx..]
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false)
}

/// ASCII terms match on word boundaries, non-ASCII terms by substring.
fn contains_term(haystack: &str, term: &str) -> bool {
    if !term.is_ascii() {
        return haystack.contains(term);
    }
    let term_lower = term.to_lowercase();
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(&term_lower) {
        let start = from + pos;
        let end = start + term_lower.len();
        if !is_alnum_before(haystack, start) && !is_alnum_after(haystack, end) {
            return true;
        }
        from = end;
    }
    false
}

fn is_claimed(term: &str, claimed: &HashSet<String>) -> bool {
    claimed
        .iter()
        .any(|c| term.contains(c.as_str()) || c.contains(term))
}

fn is_stopword(token: &str) -> bool {
    let lowered = token.to_lowercase();
    EN_STOPWORDS.contains(&lowered.as_str())
        || JP_STOP_TOKENS.iter().any(|s| token.contains(s))
        || JP_PARTICLES.contains(&token)
}

/// Splits a `\w`-run further on Japanese particles, which the regex word
/// classes treat as word characters.
fn split_jp_particles(token: &str) -> Vec<String> {
    let mut parts = vec![token.to_string()];
    for particle in JP_PARTICLES {
        parts = parts
            .iter()
            .flat_map(|t| t.split(particle).map(|s| s.to_string()))
            .collect();
    }
    parts.retain(|t| !t.is_empty());
    parts
}

fn is_significant_token(token: &str) -> bool {
    if token.is_empty()
        || token.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true)
    {
        return false;
    }
    let min_chars = if token.is_ascii() { 3 } else { 2 };
    token.chars().count() >= min_chars && !is_stopword(token)
}

fn is_name_candidate(token: &str, claimed: &HashSet<String>) -> bool {
    !token.is_empty()
        && token.chars().count() >= 2
        && !token.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true)
        && !is_stopword(token)
        && !is_claimed(token, claimed)
        && !TECH_TERMS
            .iter()
            .any(|(_, synonyms)| synonyms.iter().any(|s| token.contains(s)))
}

fn has_corporate_suffix(name: &str) -> bool {
    CORPORATE_SUFFIXES.iter().any(|s| name.contains(s))
}

fn sort_direction(lowered: &str) -> &'static str {
    let oldest = ["古い", "oldest", "earliest"];
    if oldest.iter().any(|m| lowered.contains(m)) {
        "ASC"
    } else {
        "DESC"
    }
}
