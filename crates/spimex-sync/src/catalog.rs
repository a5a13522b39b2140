//! Create/read access to the bookstore catalog tables.

use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use spimex_core::{Author, Book, Buy, BuyBook, BuyStep, City, Client, Genre, Step};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i32 },
}

#[derive(Debug, Clone)]
pub struct NewBook<'a> {
    pub title: &'a str,
    pub author_id: i32,
    pub genre_id: i32,
    pub price: f64,
    pub amount: i32,
}

#[derive(Clone)]
pub struct CatalogRepository {
    pool: PgPool,
}

impl CatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_genre(&self, name_genre: &str) -> Result<Genre, CatalogError> {
        let row = sqlx::query(
            "INSERT INTO genre (name_genre) VALUES ($1) RETURNING genre_id, name_genre",
        )
        .bind(name_genre)
        .fetch_one(&self.pool)
        .await?;
        Ok(Genre {
            genre_id: row.try_get("genre_id")?,
            name_genre: row.try_get("name_genre")?,
        })
    }

    pub async fn create_author(&self, name_author: &str) -> Result<Author, CatalogError> {
        let row = sqlx::query(
            "INSERT INTO author (name_author) VALUES ($1) RETURNING author_id, name_author",
        )
        .bind(name_author)
        .fetch_one(&self.pool)
        .await?;
        Ok(Author {
            author_id: row.try_get("author_id")?,
            name_author: row.try_get("name_author")?,
        })
    }

    pub async fn create_city(&self, name_city: &str, days_delivery: i32) -> Result<City, CatalogError> {
        let row = sqlx::query(
            "INSERT INTO city (name_city, days_delivery) VALUES ($1, $2) \
             RETURNING city_id, name_city, days_delivery",
        )
        .bind(name_city)
        .bind(days_delivery)
        .fetch_one(&self.pool)
        .await?;
        Ok(City {
            city_id: row.try_get("city_id")?,
            name_city: row.try_get("name_city")?,
            days_delivery: row.try_get("days_delivery")?,
        })
    }

    pub async fn create_client(
        &self,
        name_client: &str,
        city_id: i32,
        email: &str,
    ) -> Result<Client, CatalogError> {
        let row = sqlx::query(
            "INSERT INTO client (name_client, city_id, email) VALUES ($1, $2, $3) \
             RETURNING client_id, name_client, city_id, email",
        )
        .bind(name_client)
        .bind(city_id)
        .bind(email)
        .fetch_one(&self.pool)
        .await?;
        client_from_row(&row)
    }

    pub async fn create_book(&self, book: NewBook<'_>) -> Result<Book, CatalogError> {
        let row = sqlx::query(
            "INSERT INTO book (title, author_id, genre_id, price, amount) VALUES ($1, $2, $3, $4, $5) \
             RETURNING book_id, title, author_id, genre_id, price, amount",
        )
        .bind(book.title)
        .bind(book.author_id)
        .bind(book.genre_id)
        .bind(book.price)
        .bind(book.amount)
        .fetch_one(&self.pool)
        .await?;
        book_from_row(&row)
    }

    pub async fn create_buy(
        &self,
        client_id: i32,
        buy_description: Option<&str>,
    ) -> Result<Buy, CatalogError> {
        let row = sqlx::query(
            "INSERT INTO buy (buy_description, client_id) VALUES ($1, $2) \
             RETURNING buy_id, buy_description, client_id",
        )
        .bind(buy_description)
        .bind(client_id)
        .fetch_one(&self.pool)
        .await?;
        buy_from_row(&row)
    }

    pub async fn add_book_to_buy(
        &self,
        buy_id: i32,
        book_id: i32,
        amount: i32,
    ) -> Result<BuyBook, CatalogError> {
        let row = sqlx::query(
            "INSERT INTO buy_book (buy_id, book_id, amount) VALUES ($1, $2, $3) \
             RETURNING buy_book_id, buy_id, book_id, amount",
        )
        .bind(buy_id)
        .bind(book_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;
        buy_book_from_row(&row)
    }

    pub async fn create_step(&self, name_step: &str) -> Result<Step, CatalogError> {
        let row = sqlx::query("INSERT INTO step (name_step) VALUES ($1) RETURNING step_id, name_step")
            .bind(name_step)
            .fetch_one(&self.pool)
            .await?;
        Ok(Step {
            step_id: row.try_get("step_id")?,
            name_step: row.try_get("name_step")?,
        })
    }

    pub async fn start_buy_step(
        &self,
        buy_id: i32,
        step_id: i32,
        date_step_beg: NaiveDate,
    ) -> Result<BuyStep, CatalogError> {
        let row = sqlx::query(
            "INSERT INTO buy_step (buy_id, step_id, date_step_beg) VALUES ($1, $2, $3) \
             RETURNING buy_step_id, buy_id, step_id, date_step_beg, date_step_end",
        )
        .bind(buy_id)
        .bind(step_id)
        .bind(date_step_beg)
        .fetch_one(&self.pool)
        .await?;
        buy_step_from_row(&row)
    }

    pub async fn finish_buy_step(
        &self,
        buy_step_id: i32,
        date_step_end: NaiveDate,
    ) -> Result<BuyStep, CatalogError> {
        let row = sqlx::query(
            "UPDATE buy_step SET date_step_end = $2 WHERE buy_step_id = $1 \
             RETURNING buy_step_id, buy_id, step_id, date_step_beg, date_step_end",
        )
        .bind(buy_step_id)
        .bind(date_step_end)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CatalogError::NotFound {
            entity: "buy_step",
            id: buy_step_id,
        })?;
        buy_step_from_row(&row)
    }

    pub async fn book(&self, book_id: i32) -> Result<Option<Book>, CatalogError> {
        sqlx::query(
            "SELECT book_id, title, author_id, genre_id, price, amount FROM book WHERE book_id = $1",
        )
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(book_from_row)
        .transpose()
    }

    pub async fn books_by_author(&self, author_id: i32) -> Result<Vec<Book>, CatalogError> {
        let rows = sqlx::query(
            "SELECT book_id, title, author_id, genre_id, price, amount FROM book \
             WHERE author_id = $1 ORDER BY book_id",
        )
        .bind(author_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(book_from_row).collect()
    }

    pub async fn client(&self, client_id: i32) -> Result<Option<Client>, CatalogError> {
        sqlx::query("SELECT client_id, name_client, city_id, email FROM client WHERE client_id = $1")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(client_from_row)
            .transpose()
    }

    pub async fn buys_for_client(&self, client_id: i32) -> Result<Vec<Buy>, CatalogError> {
        let rows = sqlx::query(
            "SELECT buy_id, buy_description, client_id FROM buy WHERE client_id = $1 ORDER BY buy_id",
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(buy_from_row).collect()
    }

    pub async fn buy_books(&self, buy_id: i32) -> Result<Vec<BuyBook>, CatalogError> {
        let rows = sqlx::query(
            "SELECT buy_book_id, buy_id, book_id, amount FROM buy_book WHERE buy_id = $1 \
             ORDER BY buy_book_id",
        )
        .bind(buy_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(buy_book_from_row).collect()
    }

    pub async fn buy_steps(&self, buy_id: i32) -> Result<Vec<BuyStep>, CatalogError> {
        let rows = sqlx::query(
            "SELECT buy_step_id, buy_id, step_id, date_step_beg, date_step_end FROM buy_step \
             WHERE buy_id = $1 ORDER BY buy_step_id",
        )
        .bind(buy_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(buy_step_from_row).collect()
    }
}

fn client_from_row(row: &PgRow) -> Result<Client, CatalogError> {
    Ok(Client {
        client_id: row.try_get("client_id")?,
        name_client: row.try_get("name_client")?,
        city_id: row.try_get("city_id")?,
        email: row.try_get("email")?,
    })
}

fn book_from_row(row: &PgRow) -> Result<Book, CatalogError> {
    Ok(Book {
        book_id: row.try_get("book_id")?,
        title: row.try_get("title")?,
        author_id: row.try_get("author_id")?,
        genre_id: row.try_get("genre_id")?,
        price: row.try_get("price")?,
        amount: row.try_get("amount")?,
    })
}

fn buy_from_row(row: &PgRow) -> Result<Buy, CatalogError> {
    Ok(Buy {
        buy_id: row.try_get("buy_id")?,
        buy_description: row.try_get("buy_description")?,
        client_id: row.try_get("client_id")?,
    })
}

fn buy_book_from_row(row: &PgRow) -> Result<BuyBook, CatalogError> {
    Ok(BuyBook {
        buy_book_id: row.try_get("buy_book_id")?,
        buy_id: row.try_get("buy_id")?,
        book_id: row.try_get("book_id")?,
        amount: row.try_get("amount")?,
    })
}

fn buy_step_from_row(row: &PgRow) -> Result<BuyStep, CatalogError> {
    Ok(BuyStep {
        buy_step_id: row.try_get("buy_step_id")?,
        buy_id: row.try_get("buy_id")?,
        step_id: row.try_get("step_id")?,
        date_step_beg: row.try_get("date_step_beg")?,
        date_step_end: row.try_get("date_step_end")?,
    })
}
