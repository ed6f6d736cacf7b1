//! HTML parsing and data extraction for bank-guarantee notice pages
//!
//! Turns the markup of the two notice pages into normalized attribute
//! rows and attachment descriptors. Parsing is pure: no I/O, no clock,
//! and a block that cannot be read only adds a warning.

use indexmap::IndexMap;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use tracing::debug;

use crate::domain::{FileHandle, FileRef, PageKind};
use crate::infrastructure::parsing_error::{ParseWarning, ParsingError, ParsingResult};

const DOCUMENT_NUMBER_PATTERN: &str = r"№\s*(\S+)";

/// Phrase the registry renders instead of a notice that does not exist
pub const MISSING_PAGE_PHRASE: &str = "Запрашиваемая страница не существует";

pub const MAIN_INFO_SECTION: &str = "Сводная информация (верхний блок)";
pub const GUARANTEE_DATES_SECTION: &str = "Сроки и сумма (нижний блок)";
pub const DOCUMENT_META_SECTION: &str = "Документы: Информация о банковской гарантии";

const GUARANTEE_SECTION: &str = "Информация о банковской гарантии";
const ATTACHMENTS_LABEL: &str = "Прикрепленные файлы";
const STATUS_KEY: &str = "Статус";
const GUARANTEE_NUMBER_KEY: &str = "Номер банковской гарантии";

/// Sections of the general information page that are collected
pub const TARGET_SECTIONS: [&str; 4] = [
    "Информация о банке-гаранте",
    "Информация о поставщике (подрядчике, исполнителе) – принципале",
    "Информация о заказчике-бенефициаре",
    GUARANTEE_SECTION,
];

/// True when the markup is the registry's "page does not exist" stub
#[must_use]
pub fn is_missing_page(html: &str) -> bool {
    html.contains(MISSING_PAGE_PHRASE)
}

/// Collapses whitespace (including NBSP) and trims
#[must_use]
pub fn normalize_value(text: &str) -> String {
    text.replace('\u{a0}', " ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized attribute key: whitespace collapsed, trailing colon removed
#[must_use]
pub fn normalize_label(text: &str) -> String {
    normalize_value(text).trim_end_matches(':').trim().to_string()
}

/// One extracted attribute, in page order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAttribute {
    pub section: String,
    pub key: String,
    pub value: String,
    pub document_index: Option<u32>,
}

/// Everything extracted from one page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    pub attributes: Vec<ParsedAttribute>,
    pub files: Vec<FileRef>,
    pub warnings: Vec<ParseWarning>,
}

type SectionFields = IndexMap<String, String>;

struct NoticeSelectors {
    main_card: Selector,
    main_status: Selector,
    main_section: Selector,
    main_title: Selector,
    main_span_content: Selector,
    main_value: Selector,
    main_div_content: Selector,
    purchase_link: Selector,
    price_block: Selector,
    block_title: Selector,
    block_section: Selector,
    section_title: Selector,
    section_info: Selector,
    section_sub: Selector,
    sub_title: Selector,
    dates_table: Selector,
    table_header: Selector,
    table_row: Selector,
    table_cell: Selector,
    attachment_block: Selector,
    attachment_block_title: Selector,
    attachment: Selector,
    attachment_text: Selector,
    attachment_value: Selector,
    link: Selector,
}

fn compile(selector: &str) -> ParsingResult<Selector> {
    Selector::parse(selector).map_err(|e| ParsingError::invalid_selector(selector, e))
}

impl NoticeSelectors {
    fn new() -> ParsingResult<Self> {
        Ok(Self {
            main_card: compile("div.cardMainInfo")?,
            main_status: compile("div.cardMainInfo__status")?,
            main_section: compile("div.cardMainInfo__section")?,
            main_title: compile("span.cardMainInfo__title")?,
            main_span_content: compile("span.cardMainInfo__content")?,
            main_value: compile("div.cardMainInfo__value")?,
            main_div_content: compile("div.cardMainInfo__content")?,
            purchase_link: compile("span.cardMainInfo__purchaseLink")?,
            price_block: compile("div.price")?,
            block_title: compile("h2.blockInfo__title")?,
            block_section: compile("section.blockInfo__section")?,
            section_title: compile("span.section__title")?,
            section_info: compile("span.section__info")?,
            section_sub: compile("span.section__sub")?,
            sub_title: compile("span.title")?,
            dates_table: compile("table.blockInfo__table")?,
            table_header: compile("th")?,
            table_row: compile("tr.tableBlock__row")?,
            table_cell: compile("td")?,
            attachment_block: compile("div.card-attachments__block")?,
            attachment_block_title: compile("div.title")?,
            attachment: compile("div.attachment")?,
            attachment_text: compile("div.attachment__text")?,
            attachment_value: compile("div.attachment__value")?,
            link: compile("a[href]")?,
        })
    }
}

/// Text of all descendants, each piece trimmed, joined by single spaces
fn joined_text(element: ElementRef<'_>) -> String {
    normalize_value(
        &element
            .text()
            .map(str::trim)
            .filter(|piece| !piece.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
    )
}

/// Raw concatenated text, whitespace-normalized
fn value_text(element: Option<ElementRef<'_>>) -> String {
    element
        .map(|el| normalize_value(&el.text().collect::<String>()))
        .unwrap_or_default()
}

/// Text nodes that are direct children of `element`
fn own_text(element: ElementRef<'_>) -> String {
    element
        .children()
        .filter_map(|node| node.value().as_text().map(|text| text.text.to_string()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn has_class(element: ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

/// First following sibling element carrying `class`
fn next_sibling_with_class<'a>(element: ElementRef<'a>, tag: &str, class: &str) -> Option<ElementRef<'a>> {
    element
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .find(|sibling| sibling.value().name() == tag && has_class(*sibling, class))
}

fn is_download_link(href: &str) -> bool {
    let href = href.to_lowercase();
    href.contains("download") || href.contains("/filestore/") || href.contains("file.html?uid")
}

/// Parser for notice pages
pub struct NoticeParser {
    selectors: NoticeSelectors,
    document_number: Regex,
}

impl NoticeParser {
    pub fn new() -> ParsingResult<Self> {
        Ok(Self {
            selectors: NoticeSelectors::new()?,
            document_number: Regex::new(DOCUMENT_NUMBER_PATTERN)
                .map_err(|e| ParsingError::invalid_pattern(DOCUMENT_NUMBER_PATTERN, e))?,
        })
    }

    /// Extracts attributes and attachment descriptors from one page
    #[must_use]
    pub fn parse(&self, markup: &str, kind: PageKind) -> ParsedPage {
        let document = Html::parse_document(markup);
        let page = match kind {
            PageKind::GeneralInfo => self.parse_general_info(&document),
            PageKind::Documents => self.parse_documents(&document),
        };
        debug!(
            "Parsed {}: {} attributes, {} files, {} warnings",
            kind,
            page.attributes.len(),
            page.files.len(),
            page.warnings.len()
        );
        page
    }

    fn parse_general_info(&self, document: &Html) -> ParsedPage {
        let kind = PageKind::GeneralInfo;
        let mut warnings = Vec::new();
        let mut sections: IndexMap<String, SectionFields> = IndexMap::new();

        match self.parse_main_info(document) {
            Some(fields) if !fields.is_empty() => {
                sections.insert(MAIN_INFO_SECTION.to_string(), fields);
            }
            Some(_) => {}
            None => warnings.push(ParseWarning::new(kind, "Top summary block not found")),
        }

        for header in document.select(&self.selectors.block_title) {
            let section_name = joined_text(header);
            if !TARGET_SECTIONS.contains(&section_name.as_str()) {
                continue;
            }
            let Some(container) = header.parent().and_then(ElementRef::wrap) else {
                warnings.push(ParseWarning::new(kind, format!("Section '{section_name}' has no container")));
                continue;
            };

            let fields = self.parse_block_sections(container);
            if fields.is_empty() {
                warnings.push(ParseWarning::new(
                    kind,
                    format!("Section '{section_name}' found but no fields parsed"),
                ));
            }

            let is_guarantee = section_name == GUARANTEE_SECTION;
            sections.entry(section_name).or_default().extend(fields);

            if is_guarantee {
                match self.parse_dates_table(container) {
                    Ok(table) if !table.is_empty() => {
                        sections.entry(GUARANTEE_DATES_SECTION.to_string()).or_default().extend(table);
                    }
                    Ok(_) => {}
                    Err(message) => warnings.push(ParseWarning::new(kind, message)),
                }
            }
        }

        for required in TARGET_SECTIONS {
            if !sections.contains_key(required) {
                warnings.push(ParseWarning::new(kind, format!("Section '{required}' not found")));
            }
        }

        let attributes = sections
            .into_iter()
            .flat_map(|(section, fields)| {
                fields.into_iter().map(move |(key, value)| ParsedAttribute {
                    section: section.clone(),
                    key,
                    value,
                    document_index: None,
                })
            })
            .collect();

        ParsedPage {
            attributes,
            files: Vec::new(),
            warnings,
        }
    }

    fn parse_main_info(&self, document: &Html) -> Option<SectionFields> {
        let s = &self.selectors;
        let card = document.select(&s.main_card).next()?;
        let mut fields = SectionFields::new();

        for status in card.select(&s.main_status) {
            if let Some(title) = status.select(&s.main_title).next() {
                let text = joined_text(title);
                if !text.is_empty() {
                    fields.entry(STATUS_KEY.to_string()).or_insert(text);
                }
            }
        }

        for section in card.select(&s.main_section) {
            let title = section.select(&s.main_title).next();
            let content = section.select(&s.main_span_content).next();
            if let (Some(title), Some(content)) = (title, content) {
                let label = normalize_label(&joined_text(title));
                if !label.is_empty() {
                    fields.insert(label, value_text(Some(content)));
                }
            }

            for value_div in section.select(&s.main_value) {
                let label = normalize_label(&own_text(value_div));
                let value = value_div.select(&s.main_div_content).next();
                if !label.is_empty() && value.is_some() {
                    fields.insert(label, value_text(value));
                }
            }
        }

        if let Some(link) = card.select(&s.purchase_link).next() {
            let number = normalize_value(&joined_text(link).replace('№', ""));
            if !number.is_empty() {
                fields.entry(GUARANTEE_NUMBER_KEY.to_string()).or_insert(number);
            }
        }

        if let Some(price) = card.select(&s.price_block).next() {
            let title = price.select(&s.main_title).next();
            let content = price.select(&s.main_span_content).next();
            if let (Some(title), Some(content)) = (title, content) {
                let label = normalize_label(&joined_text(title));
                if !label.is_empty() {
                    fields.insert(label, value_text(Some(content)));
                }
            }
        }

        Some(fields)
    }

    fn parse_block_sections(&self, container: ElementRef<'_>) -> SectionFields {
        let s = &self.selectors;
        let mut fields = SectionFields::new();
        for section in container.select(&s.block_section) {
            let title = section.select(&s.section_title).next();
            let info = section.select(&s.section_info).next();
            if let (Some(title), Some(info)) = (title, info) {
                let label = normalize_label(&joined_text(title));
                if !label.is_empty() {
                    fields.insert(label, value_text(Some(info)));
                }
                continue;
            }

            if let Some(sub) = section.select(&s.section_sub).next() {
                for title_span in sub.select(&s.sub_title) {
                    let label = normalize_label(&joined_text(title_span));
                    if label.is_empty() {
                        continue;
                    }
                    let info = next_sibling_with_class(title_span, "span", "info");
                    fields.insert(label, value_text(info));
                }
            }
        }
        fields
    }

    /// Dates and amount table; rows after the first get a `(строка N)` suffix
    fn parse_dates_table(&self, container: ElementRef<'_>) -> Result<SectionFields, String> {
        let s = &self.selectors;
        let table = container
            .select(&s.dates_table)
            .next()
            .ok_or_else(|| "Guarantee dates table not found".to_string())?;

        let headers: Vec<String> = table
            .select(&s.table_header)
            .map(|th| normalize_label(&joined_text(th)))
            .collect();

        let mut fields = SectionFields::new();
        let data_rows = table
            .select(&s.table_row)
            .filter(|row| row.select(&s.table_cell).next().is_some());
        for (row_index, row) in data_rows.enumerate().map(|(i, row)| (i + 1, row)) {
            let cells = row.select(&s.table_cell).map(|td| value_text(Some(td)));
            for (header, cell) in headers.iter().zip(cells) {
                if header.is_empty() {
                    continue;
                }
                let label = if row_index == 1 {
                    header.clone()
                } else {
                    format!("{header} (строка {row_index})")
                };
                fields.insert(label, cell);
            }
        }
        Ok(fields)
    }

    /// Attachment blocks describing the guarantee itself
    fn guarantee_blocks<'a>(&'a self, document: &'a Html) -> impl Iterator<Item = ElementRef<'a>> + 'a {
        let s = &self.selectors;
        document.select(&s.attachment_block).filter(move |block| {
            block
                .select(&s.attachment_block_title)
                .next()
                .is_some_and(|title| joined_text(title) == GUARANTEE_SECTION)
        })
    }

    fn document_number(&self, attachment: ElementRef<'_>) -> String {
        let holder = attachment
            .select(&self.selectors.attachment_value)
            .find(|value| value.text().collect::<String>().contains(GUARANTEE_SECTION));
        let Some(holder) = holder else {
            return String::new();
        };
        self.document_number
            .captures(&joined_text(holder))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    }

    fn parse_documents(&self, document: &Html) -> ParsedPage {
        let kind = PageKind::Documents;
        let s = &self.selectors;
        let mut attributes = Vec::new();
        let mut files = Vec::new();
        let mut seen: HashSet<(u32, String)> = HashSet::new();

        for block in self.guarantee_blocks(document) {
            for (doc_index, attachment) in block.select(&s.attachment).enumerate() {
                let doc_index = doc_index as u32 + 1;
                let document_number = self.document_number(attachment);

                if !document_number.is_empty() {
                    attributes.push(ParsedAttribute {
                        section: DOCUMENT_META_SECTION.to_string(),
                        key: GUARANTEE_NUMBER_KEY.to_string(),
                        value: document_number.clone(),
                        document_index: Some(doc_index),
                    });
                }

                for label_div in attachment.select(&s.attachment_text) {
                    let label = normalize_label(&joined_text(label_div));
                    if label.is_empty() || label == ATTACHMENTS_LABEL {
                        continue;
                    }
                    let value = next_sibling_with_class(label_div, "div", "attachment__value");
                    attributes.push(ParsedAttribute {
                        section: DOCUMENT_META_SECTION.to_string(),
                        key: label,
                        value: value_text(value),
                        document_index: Some(doc_index),
                    });
                }

                for link in attachment.select(&s.link) {
                    let Some(href) = link.value().attr("href").map(str::trim) else {
                        continue;
                    };
                    if href.contains("signview") || !is_download_link(href) {
                        continue;
                    }
                    if !seen.insert((doc_index, href.to_string())) {
                        continue;
                    }

                    let tooltip = link
                        .value()
                        .attr("data-tooltip")
                        .map(|fragment| joined_text(Html::parse_fragment(fragment).root_element()))
                        .unwrap_or_default();
                    let filename = if tooltip.is_empty() { joined_text(link) } else { tooltip };

                    files.push(FileRef {
                        ordinal: files.len() as u32 + 1,
                        extension: FileRef::extension_of(&filename),
                        filename,
                        handle: FileHandle::Url(href.to_string()),
                        document_index: doc_index,
                        document_number: document_number.clone(),
                    });
                }
            }
        }

        let mut warnings = Vec::new();
        if files.is_empty() {
            warnings.push(ParseWarning::new(kind, "Attachments not found in document blocks"));
        }

        ParsedPage {
            attributes,
            files,
            warnings,
        }
    }
}
